use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::affinity::AffinityTracker;
use crate::announcer::HourlyAnnouncer;
use crate::character::{CharacterProfile, UserProfile};
use crate::config::CompanionConfig;
use crate::event::CompanionEvent;
use crate::history::ConversationLog;
use crate::llm_client::{CompletionService, LlmClient};
use crate::memory::{LongTermStore, MemoryConsolidator};
use crate::orchestrator::{Companion, CompanionParts, ModelHandle};

pub struct CompanionRuntime {
    pub config: CompanionConfig,
    pub companion: Arc<Companion>,
    chat: Arc<dyn CompletionService>,
    runtime: Handle,
}

pub struct CompanionRuntimeBuilder {
    config: CompanionConfig,
    event_tx: Sender<CompanionEvent>,
    runtime: Handle,
    chat: Option<Arc<dyn CompletionService>>,
    vision: Option<Arc<dyn CompletionService>>,
}

impl CompanionRuntimeBuilder {
    pub fn new(config: CompanionConfig, event_tx: Sender<CompanionEvent>, runtime: Handle) -> Self {
        Self {
            config,
            event_tx,
            runtime,
            chat: None,
            vision: None,
        }
    }

    /// Use `service` instead of an HTTP client built from `[chat]`.
    pub fn with_completion_service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.chat = Some(service);
        self
    }

    /// Use `service` instead of an HTTP client built from `[vision]`.
    pub fn with_vision_service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.vision = Some(service);
        self
    }

    pub fn build(self) -> Result<CompanionRuntime> {
        let config = self.config;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        tracing::info!("Using data directory {:?}", data_dir);

        let chat: Arc<dyn CompletionService> = match self.chat {
            Some(service) => service,
            None => Arc::new(LlmClient::new(&config.chat).context("Failed to build chat client")?),
        };
        let vision_service: Option<Arc<dyn CompletionService>> = match (self.vision, &config.vision)
        {
            (Some(service), _) => Some(service),
            (None, Some(vision)) => Some(Arc::new(
                LlmClient::new(vision).context("Failed to build vision client")?,
            )),
            (None, None) => None,
        };
        let vision = vision_service.map(|service| ModelHandle {
            service,
            sampling: config
                .vision
                .as_ref()
                .map(|vision| vision.sampling())
                .unwrap_or_else(|| config.chat.sampling()),
        });

        let log = Arc::new(ConversationLog::open(config.history_path()));
        let store = Arc::new(LongTermStore::new(config.long_term_path()));
        let document = store.load();
        let character = CharacterProfile::load(&config.character_path());
        let user = UserProfile::load(&config.user_profile_path());

        tracing::info!(
            "Loaded {} turns, {} memories (cursor {}), affinity {}",
            log.len(),
            document.memories.len(),
            document.processed_count,
            document.favorability
        );

        let affinity = Arc::new(AffinityTracker::new(
            character.tiers,
            document.favorability,
            store.clone(),
            chat.clone(),
            config.affinity.clone(),
        ));
        let memory = Arc::new(
            MemoryConsolidator::new(
                log.clone(),
                store,
                &document,
                chat.clone(),
                config.chat.sampling(),
                config.memory.clone(),
                self.runtime.clone(),
            )
            .with_event_sender(self.event_tx.clone()),
        );

        let companion = Arc::new(Companion::new(CompanionParts {
            log,
            affinity,
            memory,
            chat: ModelHandle {
                service: chat.clone(),
                sampling: config.chat.sampling(),
            },
            vision,
            persona: character.persona,
            user,
            max_history_messages: config.max_history_messages,
            event_tx: self.event_tx,
            runtime: self.runtime.clone(),
        }));

        Ok(CompanionRuntime {
            config,
            companion,
            chat,
            runtime: self.runtime,
        })
    }
}

impl CompanionRuntime {
    pub fn bootstrap(
        config: CompanionConfig,
        event_tx: Sender<CompanionEvent>,
        runtime: Handle,
    ) -> Result<Self> {
        CompanionRuntimeBuilder::new(config, event_tx, runtime).build()
    }

    /// Start the hourly announcer when enabled in config.
    pub fn spawn_announcer(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable_hourly_announcement {
            return None;
        }
        let announcer = HourlyAnnouncer::new(self.companion.clone(), self.chat.clone());
        Some(announcer.spawn(&self.runtime))
    }
}
