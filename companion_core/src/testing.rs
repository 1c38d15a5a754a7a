//! Test doubles: a scripted completion service and a fully wired companion.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::runtime::Handle;

use crate::affinity::{AffinityTracker, TierTable};
use crate::character::UserProfile;
use crate::config::{AffinityConfig, MemoryConfig};
use crate::event::CompanionEvent;
use crate::history::ConversationLog;
use crate::llm_client::{CompletionError, CompletionService, Message, SamplingParams};
use crate::memory::{LongTermDocument, LongTermStore, MemoryConsolidator};
use crate::orchestrator::{Companion, CompanionParts, ModelHandle};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub params: SamplingParams,
    pub image: Option<String>,
}

/// Replies from a queue, then from `fallback` (or `EmptyResponse`) once it runs dry.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedCompletion {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, CompletionError>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|reply| Ok(reply.into())))
    }

    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_reply(&self) -> Result<String, CompletionError> {
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or(CompletionError::EmptyResponse),
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            params: *params,
            image: None,
        });
        self.next_reply()
    }

    async fn complete_with_image(
        &self,
        system: &str,
        instruction: &str,
        image_base64: &str,
        params: &SamplingParams,
    ) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: vec![Message::system(system), Message::user(instruction)],
            params: *params,
            image: Some(image_base64.to_string()),
        });
        self.next_reply()
    }
}

pub fn chat_sampling() -> SamplingParams {
    SamplingParams {
        temperature: 0.8,
        max_tokens: 900,
        stream: false,
    }
}

/// A companion over temp-dir stores. `chat` also serves memory and vision requests.
pub struct CompanionFixture {
    pub _dir: TempDir,
    pub companion: Arc<Companion>,
    pub chat: Arc<ScriptedCompletion>,
    pub judge: Arc<ScriptedCompletion>,
    pub store: Arc<LongTermStore>,
    pub events: flume::Receiver<CompanionEvent>,
}

impl CompanionFixture {
    /// Must be called from inside a tokio runtime.
    pub fn new(chat: ScriptedCompletion, judge: ScriptedCompletion, initial_score: i64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(ConversationLog::open(dir.path().join("talk_log.json")));
        let store = Arc::new(LongTermStore::new(dir.path().join("long.json")));
        let chat = Arc::new(chat);
        let judge = Arc::new(judge);
        let (event_tx, events) = flume::unbounded();

        let affinity = Arc::new(AffinityTracker::new(
            TierTable::default(),
            initial_score,
            store.clone(),
            judge.clone(),
            AffinityConfig::default(),
        ));
        let memory = Arc::new(MemoryConsolidator::new(
            log.clone(),
            store.clone(),
            &LongTermDocument::default(),
            chat.clone(),
            chat_sampling(),
            MemoryConfig::default(),
            Handle::current(),
        ));
        let chat_handle = ModelHandle {
            service: chat.clone(),
            sampling: chat_sampling(),
        };
        let companion = Arc::new(Companion::new(CompanionParts {
            log,
            affinity,
            memory,
            vision: Some(chat_handle.clone()),
            chat: chat_handle,
            persona: "You are Pet.".to_string(),
            user: UserProfile::default(),
            max_history_messages: 20,
            event_tx,
            runtime: Handle::current(),
        }));

        Self {
            _dir: dir,
            companion,
            chat,
            judge,
            store,
            events,
        }
    }
}
