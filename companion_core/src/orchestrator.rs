use anyhow::{bail, Result};
use flume::Sender;
use regex_lite::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::affinity::{AffinityTracker, AffinityUpdate};
use crate::character::UserProfile;
use crate::event::CompanionEvent;
use crate::history::{ConversationLog, Turn, TurnRole};
use crate::llm_client::{CompletionError, CompletionService, SamplingParams};
use crate::memory::MemoryConsolidator;
use crate::prompt::{assemble, render_recent_context, PromptInput};

/// Turns of recent conversation quoted to the vision model.
const OBSERVATION_CONTEXT_TURNS: usize = 20;

const OBSERVATION_INSTRUCTION: &str = "Look at this screenshot:\n\
- Work out roughly what the user is doing (browsing, coding, gaming, ...)\n\
- Comment on it the way your character would\n\n\
Rules:\n\
- Only describe what is really in the picture, never invent anything\n\
- If you are not sure, say you can't quite make it out\n\
- Stay in character and let your current affinity show\n\
- You may refer to the recent conversation and your memories\n\
- Small actions or expressions in parentheses are welcome\n\n\
Reply with one or two short sentences.";

/// A model endpoint plus the sampling parameters it is called with.
#[derive(Clone)]
pub struct ModelHandle {
    pub service: Arc<dyn CompletionService>,
    pub sampling: SamplingParams,
}

/// Everything a [`Companion`] coordinates.
pub struct CompanionParts {
    pub log: Arc<ConversationLog>,
    pub affinity: Arc<AffinityTracker>,
    pub memory: Arc<MemoryConsolidator>,
    pub chat: ModelHandle,
    pub vision: Option<ModelHandle>,
    pub persona: String,
    pub user: UserProfile,
    pub max_history_messages: usize,
    pub event_tx: Sender<CompanionEvent>,
    pub runtime: Handle,
}

/// What one conversational turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub reply: String,
    /// The chat call failed and `reply` is a diagnostic.
    pub failed: bool,
    pub affinity_delta: Option<i64>,
    pub affinity: Option<AffinityUpdate>,
}

/// Drives user turns end-to-end: log, prompt, completion, affinity judgment and
/// memory consolidation, reporting back through [`CompanionEvent`]s.
pub struct Companion {
    log: Arc<ConversationLog>,
    affinity: Arc<AffinityTracker>,
    memory: Arc<MemoryConsolidator>,
    chat: ModelHandle,
    vision: Option<ModelHandle>,
    persona: String,
    user: UserProfile,
    max_history_messages: usize,
    event_tx: Sender<CompanionEvent>,
    runtime: Handle,
    busy: Arc<AtomicBool>,
    displaying: AtomicBool,
}

/// Clears the busy flag when the background turn ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Companion {
    pub fn new(parts: CompanionParts) -> Self {
        Self {
            log: parts.log,
            affinity: parts.affinity,
            memory: parts.memory,
            chat: parts.chat,
            vision: parts.vision,
            persona: parts.persona,
            user: parts.user,
            max_history_messages: parts.max_history_messages,
            event_tx: parts.event_tx,
            runtime: parts.runtime,
            busy: Arc::new(AtomicBool::new(false)),
            displaying: AtomicBool::new(false),
        }
    }

    pub fn log(&self) -> &Arc<ConversationLog> {
        &self.log
    }

    pub fn affinity(&self) -> &Arc<AffinityTracker> {
        &self.affinity
    }

    pub fn memory(&self) -> &Arc<MemoryConsolidator> {
        &self.memory
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn has_vision(&self) -> bool {
        self.vision.is_some()
    }

    /// Whether a reply is being produced right now.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// The presentation layer finished showing the last reply.
    pub fn display_finished(&self) {
        self.displaying.store(false, Ordering::SeqCst);
    }

    fn acquire(&self) -> Result<BusyGuard> {
        if self.busy.swap(true, Ordering::SeqCst) {
            bail!("Still waiting for the previous reply");
        }
        Ok(BusyGuard(self.busy.clone()))
    }

    fn emit(&self, event: CompanionEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("Presentation loop has gone away, dropping event");
        }
    }

    fn show(&self, text: String) {
        self.displaying.store(true, Ordering::SeqCst);
        self.emit(CompanionEvent::ResponseReady(text));
    }

    /// Record the user's message and produce the reply in the background.
    ///
    /// Refused while a previous turn is still in flight.
    pub fn send_message(self: &Arc<Self>, text: &str) -> Result<JoinHandle<TurnOutcome>> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Message is empty");
        }
        let guard = self.acquire()?;

        if self.displaying.swap(false, Ordering::SeqCst) {
            self.emit(CompanionEvent::ClearDisplay);
        }
        self.memory.trigger();
        self.log.append(TurnRole::User, text);

        let this = Arc::clone(self);
        let text = text.to_string();
        Ok(self.runtime.spawn(async move {
            let _guard = guard;
            this.process_turn(&text).await
        }))
    }

    /// Everything after the user turn is logged: completion, reply, judgment, signals.
    pub async fn process_turn(&self, user_text: &str) -> TurnOutcome {
        let turns = self.log.all_turns();
        let affinity_summary = self.affinity.describe();
        let memory_summary = self.memory.summary();
        let profile = self.user.info_string();

        let messages = assemble(&PromptInput {
            persona: &self.persona,
            user_profile: &profile,
            affinity_summary: Some(affinity_summary.as_str()),
            memory_summary: memory_summary.as_deref(),
            turns: &turns,
            new_user_content: None,
        })
        .trimmed(self.max_history_messages);

        tracing::debug!("Requesting reply with {} messages", messages.len());
        let (reply, failed) = match self.chat.service.complete(&messages, &self.chat.sampling).await
        {
            Ok(reply) => (reply, false),
            Err(e) => {
                tracing::warn!("Chat completion failed: {}", e);
                (e.diagnostic(), true)
            }
        };

        self.log.append(TurnRole::Assistant, reply.as_str());

        let mut outcome = TurnOutcome {
            reply: reply.clone(),
            failed,
            affinity_delta: None,
            affinity: None,
        };

        if !failed {
            let delta = self.affinity.judge(user_text, &reply).await;
            let update = self.affinity.apply(delta);
            if let Some(delta) = delta.filter(|delta| *delta != 0) {
                self.log.annotate_last_assistant(delta, update.score);
            }
            if update.tier_changed {
                self.emit(CompanionEvent::AffinityTierChanged {
                    old_label: update.previous_label.clone(),
                    new_label: update.tier_label.clone(),
                    score: update.score,
                });
            }
            outcome.affinity_delta = delta;
            outcome.affinity = Some(update);
        }

        self.show(reply);
        self.emit(CompanionEvent::TurnCompleted);
        outcome
    }

    /// Record a poke. Consecutive pokes collapse into one event with a running count.
    pub fn poke(&self) -> Turn {
        let base = format!("{} poked {}", self.user.display_name(), self.user.pet_name());
        self.log
            .amend_last_event(|content| merge_poke(content, &base))
            .unwrap_or_else(|| self.log.append(TurnRole::Event, base.as_str()))
    }

    /// Persona, affinity, profile and memories as one system block.
    pub fn context_block(&self) -> String {
        let mut parts = vec![format!(
            "[Who you are] {}\nAlways speak in the first person and keep this personality.",
            self.persona
        )];
        parts.push(format!(
            "[How you feel] {}\nLet this attitude towards the user show.",
            self.affinity.describe()
        ));
        let profile = self.user.info_string();
        if !profile.is_empty() {
            parts.push(format!("[User profile] {}", profile));
        }
        if let Some(memories) = self.memory.summary() {
            parts.push(format!("[Shared memories] {}", memories));
        }
        parts.join("\n\n")
    }

    /// Comment on an image in the background. Needs a vision model.
    pub fn observe_image(self: &Arc<Self>, image_base64: String) -> Result<JoinHandle<String>> {
        if self.vision.is_none() {
            bail!("No vision model is configured");
        }
        let guard = self.acquire()?;
        if self.displaying.swap(false, Ordering::SeqCst) {
            self.emit(CompanionEvent::ClearDisplay);
        }

        let this = Arc::clone(self);
        Ok(self.runtime.spawn(async move {
            let _guard = guard;
            this.observe(&image_base64).await
        }))
    }

    /// Ask the vision model about `image_base64`; the reply is logged on success.
    pub async fn observe(&self, image_base64: &str) -> String {
        let Some(vision) = &self.vision else {
            return CompletionError::Unsupported.diagnostic();
        };

        let turns = self.log.all_turns();
        let instruction = if turns.is_empty() {
            OBSERVATION_INSTRUCTION.to_string()
        } else {
            format!(
                "[Recent conversation]\n{}\n\n{}",
                render_recent_context(&turns, OBSERVATION_CONTEXT_TURNS, self.user.display_name()),
                OBSERVATION_INSTRUCTION
            )
        };

        let reply = match vision
            .service
            .complete_with_image(
                &self.context_block(),
                &instruction,
                image_base64,
                &vision.sampling,
            )
            .await
        {
            Ok(reply) => {
                self.log.append(TurnRole::Assistant, reply.as_str());
                reply
            }
            Err(e) => {
                tracing::warn!("Image observation failed: {}", e);
                e.diagnostic()
            }
        };

        self.show(reply.clone());
        self.emit(CompanionEvent::TurnCompleted);
        reply
    }

    /// Log an announcement as something the companion said, and surface it.
    pub fn announce(&self, text: &str) {
        self.log.append(TurnRole::Assistant, text);
        if self.displaying.swap(true, Ordering::SeqCst) {
            self.emit(CompanionEvent::ClearDisplay);
        }
        self.emit(CompanionEvent::Announcement(text.to_string()));
    }
}

/// `"A poked B"` becomes `"A poked B x2"`, `"A poked B x2"` becomes `"A poked B x3"`.
fn merge_poke(content: &str, base: &str) -> Option<String> {
    let rest = content.strip_prefix(base)?;
    if rest.is_empty() {
        return Some(format!("{} x2", base));
    }
    let counter = Regex::new(r"^ x(\d+)$").ok()?;
    let count: u64 = counter.captures(rest)?.get(1)?.as_str().parse().ok()?;
    Some(format!("{} x{}", base, count.saturating_add(1)))
}
