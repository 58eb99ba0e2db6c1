use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::EnginePolicy;

pub const CONFIG_FILE_NAME: &str = "pronto_config.toml";

/// Which collaborator produces character replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonerKind {
    #[default]
    Scripted,
    Llm,
}

impl ReasonerKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scripted" | "script" | "offline" => Some(ReasonerKind::Scripted),
            "llm" | "openai" => Some(ReasonerKind::Llm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub reasoner: ReasonerKind,

    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub llm_max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Extra character cards (`*.json` / `*.toml`) loaded next to the built-ins.
    #[serde(default)]
    pub profiles_dir: Option<String>,
    #[serde(default = "default_character")]
    pub default_character: String,

    #[serde(default)]
    pub retry_malformed_responses: bool,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_scripted_latency_ms")]
    pub scripted_latency_ms: u64,
    /// Sessions untouched for this long are closed. 0 keeps them forever.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_character() -> String {
    crate::character::abby::ABBY_ID.to_string()
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_scripted_latency_ms() -> u64 {
    1_500
}

fn default_session_idle_timeout_secs() -> u64 {
    3_600
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reasoner: ReasonerKind::default(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_temperature(),
            llm_max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            profiles_dir: None,
            default_character: default_character(),
            retry_malformed_responses: false,
            max_delay_ms: default_max_delay_ms(),
            scripted_latency_ms: default_scripted_latency_ms(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
        }
    }
}

impl ChatConfig {
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

    /// `PRONTO_CONFIG` if set, otherwise `pronto_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("PRONTO_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join(CONFIG_FILE_NAME),
        }
    }

    /// Load the config file, falling back to defaults + env vars when it is
    /// missing or unreadable.
    pub fn load() -> Self {
        let path = Self::config_path();

        if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str::<ChatConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(kind) = lookup("PRONTO_REASONER") {
            match ReasonerKind::parse(&kind) {
                Some(kind) => config.reasoner = kind,
                None => tracing::warn!("Ignoring unknown PRONTO_REASONER value '{}'", kind),
            }
        }

        if let Some(url) = lookup("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Some(model) = lookup("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Some(key) = lookup("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Some(dir) = lookup("PRONTO_PROFILES_DIR") {
            config.profiles_dir = Some(dir);
        }

        if let Some(name) = lookup("PRONTO_DEFAULT_CHARACTER") {
            config.default_character = name;
        }

        if let Some(enabled) = lookup("PRONTO_RETRY_MALFORMED") {
            config.retry_malformed_responses = parse_flag(&enabled);
        }

        if let Some(ms) = lookup("PRONTO_MAX_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                config.max_delay_ms = ms;
            }
        }

        if let Some(ms) = lookup("PRONTO_SCRIPTED_LATENCY_MS") {
            if let Ok(ms) = ms.parse() {
                config.scripted_latency_ms = ms;
            }
        }

        if let Some(secs) = lookup("PRONTO_SESSION_IDLE_SECS") {
            if let Ok(secs) = secs.parse() {
                config.session_idle_timeout_secs = secs;
            }
        }

        config
    }

    pub fn engine_policy(&self) -> EnginePolicy {
        EnginePolicy {
            retry_malformed_responses: self.retry_malformed_responses,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn scripted_latency(&self) -> Duration {
        Duration::from_millis(self.scripted_latency_ms)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.session_idle_timeout_secs))
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
