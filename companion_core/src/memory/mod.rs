pub mod parse;
pub mod state;

use flume::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::event::CompanionEvent;
use crate::history::ConversationLog;
use crate::llm_client::{CompletionService, Message, SamplingParams};
use crate::store::now_timestamp;
use parse::{clean_distillation, parse_numbered_list, render_transcript};

pub use state::{LongTermDocument, LongTermStore, MemoryEntry};

const DISTILLER_PERSONA: &str =
    "You are an efficient information distiller who is good at extracting the core point.";
const COMPRESSOR_PERSONA: &str =
    "You are an efficient information compressor who is good at keeping only what matters.";

#[derive(Debug, Default)]
struct MemoryState {
    processed_count: usize,
    memories: Vec<MemoryEntry>,
}

/// What one consolidation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub batches_planned: usize,
    pub batches_completed: usize,
    /// A distillation failed and the run stopped early.
    pub aborted: bool,
    pub compressions: usize,
    pub compressions_skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    NotNeeded,
    Compressed { kept: usize },
    /// Proposal size fell outside the accepted bounds; prior set kept.
    Rejected { proposed: usize },
    Failed,
}

/// Folds the unprocessed tail of the conversation log into short long-term memories
/// and compresses the memory set when it reaches capacity.
///
/// `processed_count` only moves forward, and only after a batch was distilled.
pub struct MemoryConsolidator {
    log: Arc<ConversationLog>,
    store: Arc<LongTermStore>,
    service: Arc<dyn CompletionService>,
    sampling: SamplingParams,
    config: MemoryConfig,
    state: Mutex<MemoryState>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    runtime: Handle,
    event_tx: Option<Sender<CompanionEvent>>,
}

impl MemoryConsolidator {
    pub fn new(
        log: Arc<ConversationLog>,
        store: Arc<LongTermStore>,
        document: &LongTermDocument,
        service: Arc<dyn CompletionService>,
        sampling: SamplingParams,
        config: MemoryConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            log,
            store,
            service,
            sampling: SamplingParams {
                stream: false,
                ..sampling
            },
            config,
            state: Mutex::new(MemoryState {
                processed_count: document.processed_count,
                memories: document.memories.clone(),
            }),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            runtime,
            event_tx: None,
        }
    }

    pub fn with_event_sender(mut self, event_tx: Sender<CompanionEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn processed_count(&self) -> usize {
        self.lock().processed_count
    }

    pub fn memories(&self) -> Vec<MemoryEntry> {
        self.lock().memories.clone()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.log.len().saturating_sub(self.processed_count())
    }

    pub fn should_consolidate(&self) -> bool {
        self.unprocessed_count() >= self.config.consolidation_threshold
    }

    /// Prompt block listing every memory, `None` while the set is empty.
    pub fn summary(&self) -> Option<String> {
        let state = self.lock();
        if state.memories.is_empty() {
            return None;
        }
        let lines = state
            .memories
            .iter()
            .map(|m| format!("- {}", m.content))
            .collect::<Vec<_>>()
            .join("\n");
        Some(format!("Long-term core memories:\n{}", lines))
    }

    /// Start a background run when the threshold is reached and no run is active.
    pub fn trigger(self: &Arc<Self>) -> Option<JoinHandle<ConsolidationReport>> {
        if !self.should_consolidate() {
            return None;
        }
        let guard = match self.run_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Consolidation already running, trigger ignored");
                return None;
            }
        };

        tracing::info!(
            "{} unprocessed turns, starting memory consolidation",
            self.unprocessed_count()
        );
        let this = Arc::clone(self);
        Some(self.runtime.spawn(async move {
            let _guard = guard;
            this.consolidate().await
        }))
    }

    /// Distill `floor(unprocessed / threshold)` batches, stopping at the first failure.
    pub async fn consolidate(&self) -> ConsolidationReport {
        let threshold = self.config.consolidation_threshold;
        let mut report = ConsolidationReport {
            batches_planned: self.unprocessed_count() / threshold,
            ..Default::default()
        };

        for batch_number in 1..=report.batches_planned {
            let start = self.processed_count();
            let batch = self.log.turns_from(start, threshold);
            if batch.len() < threshold {
                tracing::debug!("Conversation log shrank during consolidation, stopping");
                break;
            }

            tracing::info!(
                "[memory] batch {}/{}: turns {}..{}",
                batch_number,
                report.batches_planned,
                start,
                start + batch.len()
            );

            let Some(content) = self.distill(&render_transcript(&batch)).await else {
                tracing::warn!(
                    "[memory] distillation failed, leaving {} turns pending",
                    batch.len()
                );
                report.aborted = true;
                break;
            };

            let memory_count = {
                let mut state = self.lock();
                let id = state.memories.len();
                tracing::info!("[memory] stored memory {}: {}", id, content);
                state.memories.push(MemoryEntry {
                    id,
                    timestamp: now_timestamp(),
                    content,
                    source_count: batch.len(),
                });
                state.processed_count += batch.len();
                state.memories.len()
            };
            report.batches_completed += 1;
            self.persist();

            if memory_count >= self.config.memory_capacity {
                match self.compress().await {
                    CompressionOutcome::Compressed { .. } => report.compressions += 1,
                    CompressionOutcome::Rejected { .. } | CompressionOutcome::Failed => {
                        report.compressions_skipped += 1
                    }
                    CompressionOutcome::NotNeeded => {}
                }
            }

            self.publish();
        }

        if report.batches_completed > 0 {
            let state = self.lock();
            tracing::info!(
                "[memory] consolidation finished: {} batch(es), {} memories, cursor at {}",
                report.batches_completed,
                state.memories.len(),
                state.processed_count
            );
        }
        report
    }

    async fn distill(&self, transcript: &str) -> Option<String> {
        let limit = self.config.max_memory_chars;
        let prompt = format!(
            "Distill the following conversation into one core memory:\n\
             1. Keep only information worth remembering long-term\n\
             2. At most {limit} characters\n\
             3. Concise, no filler words\n\
             4. Objective third-person description\n\n\
             Conversation:\n{transcript}\n\n\
             Output only the memory itself, with no explanation."
        );
        let messages = [Message::system(DISTILLER_PERSONA), Message::user(prompt)];

        match self.service.complete(&messages, &self.sampling).await {
            Ok(response) => clean_distillation(&response, limit),
            Err(e) => {
                tracing::warn!("[memory] distillation request failed: {}", e);
                None
            }
        }
    }

    /// Ask for a smaller curated set once the memory set is at capacity.
    pub async fn compress(&self) -> CompressionOutcome {
        let snapshot = self.memories();
        if snapshot.len() < self.config.memory_capacity {
            return CompressionOutcome::NotNeeded;
        }

        let (min, max, limit) = (
            self.config.compressed_min,
            self.config.compressed_max,
            self.config.max_memory_chars,
        );
        let numbered = snapshot
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. {}", i + 1, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Compress the following {count} long-term memories further:\n\
             1. Keep the most important, core events and information\n\
             2. Reduce them to {min}-{max} memories\n\
             3. Each at most {limit} characters\n\
             4. Drop duplicate, minor or outdated memories\n\
             5. Output a numbered list\n\n\
             Current memories:\n{numbered}\n\n\
             Output only the list, with no explanation.",
            count = snapshot.len()
        );
        let messages = [Message::system(COMPRESSOR_PERSONA), Message::user(prompt)];

        let response = match self.service.complete(&messages, &self.sampling).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "[memory] compression request failed, keeping {} memories: {}",
                    snapshot.len(),
                    e
                );
                return CompressionOutcome::Failed;
            }
        };

        let entries = parse_numbered_list(&response, limit);
        if entries.len() < min || entries.len() > max {
            tracing::warn!(
                "[memory] compression proposed {} memories (expected {}-{}), skipping",
                entries.len(),
                min,
                max
            );
            return CompressionOutcome::Rejected {
                proposed: entries.len(),
            };
        }

        let kept = entries.len();
        let timestamp = now_timestamp();
        self.lock().memories = entries
            .into_iter()
            .enumerate()
            .map(|(id, content)| MemoryEntry {
                id,
                timestamp,
                content,
                source_count: 0,
            })
            .collect();
        self.persist();
        tracing::info!(
            "[memory] compressed {} memories into {}",
            snapshot.len(),
            kept
        );
        CompressionOutcome::Compressed { kept }
    }

    /// Remove one memory and renumber the rest densely.
    pub fn delete_memory(&self, id: usize) -> bool {
        {
            let mut state = self.lock();
            let before = state.memories.len();
            state.memories.retain(|m| m.id != id);
            if state.memories.len() == before {
                return false;
            }
            for (index, memory) in state.memories.iter_mut().enumerate() {
                memory.id = index;
            }
        }
        self.persist();
        true
    }

    /// Empty the conversation log and rewind the cursor with it. Memories are kept.
    ///
    /// Refused while a consolidation run is active.
    pub fn clear_history(&self) -> bool {
        let Ok(_run) = self.run_lock.try_lock() else {
            tracing::debug!("Consolidation running, history not cleared");
            return false;
        };
        {
            let mut state = self.lock();
            self.log.clear();
            state.processed_count = 0;
        }
        self.persist();
        tracing::info!("Conversation history cleared");
        true
    }

    /// Write the cursor and memory set, holding the state lock until the file is replaced.
    fn persist(&self) {
        let state = self.lock();
        if let Err(e) = self.store.update(|doc| {
            doc.processed_count = state.processed_count;
            doc.memories = state.memories.clone();
        }) {
            tracing::warn!("Failed to save long-term memory: {:#}", e);
        }
    }

    fn publish(&self) {
        if let Some(tx) = &self.event_tx {
            let state = self.lock();
            let _ = tx.send(CompanionEvent::MemoryConsolidated {
                memory_count: state.memories.len(),
                processed_count: state.processed_count,
            });
        }
    }
}
