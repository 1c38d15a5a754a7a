use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::llm_client::SamplingParams;

/// Connection and sampling settings for one OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ModelConfig {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Unprocessed turns needed before a batch is distilled.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: usize,
    /// Long-term entry count that triggers compression.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    #[serde(default = "default_compressed_min")]
    pub compressed_min: usize,
    #[serde(default = "default_compressed_max")]
    pub compressed_max: usize,
    /// Character budget for a single memory entry.
    #[serde(default = "default_max_memory_chars")]
    pub max_memory_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: default_consolidation_threshold(),
            memory_capacity: default_memory_capacity(),
            compressed_min: default_compressed_min(),
            compressed_max: default_compressed_max(),
            max_memory_chars: default_max_memory_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Token the judge must emit right before the signed delta, e.g. `Affinity+2`.
    #[serde(default = "default_affinity_marker")]
    pub marker: String,
    #[serde(default = "default_judge_temperature")]
    pub judge_temperature: f32,
    #[serde(default = "default_judge_max_tokens")]
    pub judge_max_tokens: u32,
}

impl AffinityConfig {
    pub fn judge_sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.judge_temperature,
            max_tokens: self.judge_max_tokens,
            stream: false,
        }
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            marker: default_affinity_marker(),
            judge_temperature: default_judge_temperature(),
            judge_max_tokens: default_judge_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    // Storage
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    #[serde(default = "default_long_term_file")]
    pub long_term_file: String,
    #[serde(default = "default_character_file")]
    pub character_file: String,
    #[serde(default = "default_user_profile_file")]
    pub user_profile_file: String,

    // Models
    #[serde(default)]
    pub chat: ModelConfig,
    #[serde(default)]
    pub vision: Option<ModelConfig>,

    // Conversation window sent to the chat model
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub affinity: AffinityConfig,

    #[serde(default)]
    pub enable_hourly_announcement: bool,
}

fn default_api_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    900
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_consolidation_threshold() -> usize {
    20
}

fn default_memory_capacity() -> usize {
    20
}

fn default_compressed_min() -> usize {
    5
}

fn default_compressed_max() -> usize {
    10
}

fn default_max_memory_chars() -> usize {
    15
}

fn default_affinity_marker() -> String {
    "Affinity".to_string()
}

fn default_judge_temperature() -> f32 {
    0.3
}

fn default_judge_max_tokens() -> u32 {
    50
}

fn default_history_file() -> String {
    "talk_log.json".to_string()
}

fn default_long_term_file() -> String {
    "long.json".to_string()
}

fn default_character_file() -> String {
    "character.json".to_string()
}

fn default_user_profile_file() -> String {
    "user_info.json".to_string()
}

fn default_max_history_messages() -> usize {
    20
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            history_file: default_history_file(),
            long_term_file: default_long_term_file(),
            character_file: default_character_file(),
            user_profile_file: default_user_profile_file(),
            chat: ModelConfig::default(),
            vision: None,
            max_history_messages: default_max_history_messages(),
            memory: MemoryConfig::default(),
            affinity: AffinityConfig::default(),
            enable_hourly_announcement: false,
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load config from companion_config.toml (next to executable), falling back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to load {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No usable config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: CompanionConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config.normalized())
    }

    /// Defaults overlaid with `COMPANION_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("COMPANION_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = Some(dir);
            }
        }

        if let Ok(url) = env::var("COMPANION_API_URL") {
            config.chat.api_url = url;
        }

        if let Ok(key) = env::var("COMPANION_API_KEY") {
            config.chat.api_key = Some(key);
        }

        if let Ok(model) = env::var("COMPANION_MODEL") {
            config.chat.model = model;
        }

        if let Ok(key) = env::var("COMPANION_VISION_API_KEY") {
            let vision = config.vision.get_or_insert_with(ModelConfig::default);
            vision.api_key = Some(key);
        }

        if let Some(enabled) = env_flag("COMPANION_ENABLE_ANNOUNCER") {
            config.enable_hourly_announcement = enabled;
        }

        config.normalized()
    }

    /// Replace memory constants that would make consolidation or compression impossible.
    fn normalized(mut self) -> Self {
        let memory = &mut self.memory;
        if memory.consolidation_threshold == 0 {
            tracing::warn!("memory.consolidation_threshold must be positive; using default");
            memory.consolidation_threshold = default_consolidation_threshold();
        }
        if memory.max_memory_chars == 0 {
            memory.max_memory_chars = default_max_memory_chars();
        }
        if memory.compressed_min == 0
            || memory.compressed_min > memory.compressed_max
            || memory.compressed_max >= memory.memory_capacity
        {
            tracing::warn!(
                "memory compression bounds {}..={} (capacity {}) are inconsistent; using defaults",
                memory.compressed_min,
                memory.compressed_max,
                memory.memory_capacity
            );
            memory.memory_capacity = default_memory_capacity();
            memory.compressed_min = default_compressed_min();
            memory.compressed_max = default_compressed_max();
        }
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join("companion"))
                .unwrap_or_else(|| Self::get_base_dir().join("data")),
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir().join(&self.history_file)
    }

    pub fn long_term_path(&self) -> PathBuf {
        self.data_dir().join(&self.long_term_file)
    }

    pub fn character_path(&self) -> PathBuf {
        self.data_dir().join(&self.character_file)
    }

    pub fn user_profile_path(&self) -> PathBuf {
        self.data_dir().join(&self.user_profile_file)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().map(|value| {
        value.eq_ignore_ascii_case("1")
            || value.eq_ignore_ascii_case("true")
            || value.eq_ignore_ascii_case("yes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: CompanionConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_history_messages, 20);
        assert_eq!(config.memory.consolidation_threshold, 20);
        assert_eq!(config.memory.max_memory_chars, 15);
        assert_eq!(config.affinity.judge_max_tokens, 50);
        assert!(config.vision.is_none());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: CompanionConfig = toml::from_str(
            r#"
            data_dir = "/tmp/companion"

            [chat]
            model = "local-model"
            stream = true

            [vision]
            api_url = "http://localhost:1234/v1"
            "#,
        )
        .unwrap();
        assert_eq!(config.chat.model, "local-model");
        assert!(config.chat.stream);
        assert_eq!(config.chat.max_tokens, 900);
        let vision = config.vision.as_ref().expect("vision section");
        assert_eq!(vision.api_url, "http://localhost:1234/v1");
        assert_eq!(
            config.history_path(),
            PathBuf::from("/tmp/companion").join("talk_log.json")
        );
    }

    #[test]
    fn inconsistent_compression_bounds_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion_config.toml");
        fs::write(
            &path,
            "[memory]\ncompressed_min = 12\ncompressed_max = 8\nconsolidation_threshold = 0\n",
        )
        .unwrap();

        let config = CompanionConfig::load_from(&path).unwrap();
        assert_eq!(config.memory.compressed_min, 5);
        assert_eq!(config.memory.compressed_max, 10);
        assert_eq!(config.memory.consolidation_threshold, 20);
    }
}
