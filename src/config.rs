use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Which comment transport the controller runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentSource {
    /// Polled YouTube Data API.
    Api,
    /// Push-style websocket feed.
    Push,
}

impl Default for CommentSource {
    fn default() -> Self {
        CommentSource::Api
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    // Comment ingestion
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub comment_source: CommentSource,
    #[serde(default)]
    pub live_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    // Conversation continuity
    #[serde(default)]
    pub continuity_mode: bool,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // LLM backing the content engine (OpenAI-compatible endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
}

pub fn default_socket_url() -> String {
    "ws://localhost:11180/sub".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_system_prompt() -> String {
    "You are a friendly streamer persona. Keep the conversation going naturally, \
     react to viewer comments, and stay in character."
        .to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            comment_source: CommentSource::default(),
            live_id: String::new(),
            api_key: String::new(),
            socket_url: default_socket_url(),
            poll_interval_secs: default_poll_interval(),
            continuity_mode: false,
            system_prompt: default_system_prompt(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
        }
    }
}

impl ChatConfig {
    /// Directory containing the executable; config lives next to it.
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("streamtalk_config.toml")
    }

    /// Load from streamtalk_config.toml, falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<ChatConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(enabled) = env::var("STREAMTALK_ENABLED") {
            config.enabled = parse_bool(&enabled);
        }

        if let Ok(source) = env::var("STREAMTALK_COMMENT_SOURCE") {
            match source.trim().to_ascii_lowercase().as_str() {
                "api" => config.comment_source = CommentSource::Api,
                "push" => config.comment_source = CommentSource::Push,
                other => tracing::warn!("Unknown STREAMTALK_COMMENT_SOURCE '{}'", other),
            }
        }

        if let Ok(live_id) = env::var("STREAMTALK_LIVE_ID") {
            config.live_id = live_id;
        }

        if let Ok(key) = env::var("STREAMTALK_API_KEY") {
            config.api_key = key;
        }

        if let Ok(url) = env::var("STREAMTALK_SOCKET_URL") {
            if !url.trim().is_empty() {
                config.socket_url = url;
            }
        }

        if let Ok(interval) = env::var("STREAMTALK_POLL_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.poll_interval_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("STREAMTALK_CONTINUITY_MODE") {
            config.continuity_mode = parse_bool(&enabled);
        }

        if let Ok(prompt) = env::var("STREAMTALK_SYSTEM_PROMPT") {
            if !prompt.trim().is_empty() {
                config.system_prompt = prompt;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        config
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

/// Continuity counters and the polling cursor. Kept alongside the settings so
/// they survive controller restarts within one process.
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    pub page_token: String,
    pub no_comment_count: u32,
    pub continuation_count: u32,
    pub sleep_mode: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    config: ChatConfig,
    state: RuntimeState,
}

/// Shared settings-and-state object passed into the controller and each
/// transport at construction. Every read takes the latest value; every write
/// touches a single field.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ConfigStore {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                config,
                state: RuntimeState::default(),
            })),
        }
    }

    pub async fn config(&self) -> ChatConfig {
        self.inner.read().await.config.clone()
    }

    pub async fn update_config(&self, config: ChatConfig) {
        self.inner.write().await.config = config;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.write().await.config.enabled = enabled;
    }

    pub async fn set_comment_source(&self, source: CommentSource) {
        self.inner.write().await.config.comment_source = source;
    }

    pub async fn page_token(&self) -> String {
        self.inner.read().await.state.page_token.clone()
    }

    pub async fn set_page_token(&self, token: String) {
        self.inner.write().await.state.page_token = token;
    }

    pub async fn no_comment_count(&self) -> u32 {
        self.inner.read().await.state.no_comment_count
    }

    pub async fn set_no_comment_count(&self, count: u32) {
        self.inner.write().await.state.no_comment_count = count;
    }

    pub async fn continuation_count(&self) -> u32 {
        self.inner.read().await.state.continuation_count
    }

    pub async fn set_continuation_count(&self, count: u32) {
        self.inner.write().await.state.continuation_count = count;
    }

    pub async fn sleep_mode(&self) -> bool {
        self.inner.read().await.state.sleep_mode
    }

    pub async fn set_sleep_mode(&self, sleep: bool) {
        self.inner.write().await.state.sleep_mode = sleep;
    }

    /// Drop the polling cursor and all continuity counters. Called when
    /// ingestion is turned off or the transport is switched.
    pub async fn reset_runtime_state(&self) {
        self.inner.write().await.state = RuntimeState::default();
    }
}
