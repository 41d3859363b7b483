//! Configuration management for loopsmith
//!
//! Defaults, then `~/.config/loopsmith/config.toml` (or an explicit file),
//! then `LOOPSMITH_*` environment overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the model-service credential.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant. \
You work inside a project directory and can only change it through the provided tools. \
Use paths relative to the project root; absolute paths and `..` are rejected. \
Prefer create_file for new files and update_file for targeted edits. \
When the work is done, reply with a short summary and no tool calls.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub sandbox_root: PathBuf,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub max_history: usize,
    pub max_hops: usize,
    pub max_turns: usize,
    pub tests_dir: String,
    pub test_command: String,
    pub shell_timeout_secs: u64,
    pub test_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub retry_pause_ms: u64,
    /// Base commands the model may run through `run_shell`. `None` allows any.
    pub allowed_commands: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("project"),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history: 40,
            max_hops: 10,
            max_turns: 10,
            tests_dir: "tests".to_string(),
            test_command: "pytest --maxfail=1 --disable-warnings -q".to_string(),
            shell_timeout_secs: 120,
            test_timeout_secs: 600,
            request_timeout_secs: 120,
            retry_pause_ms: 1000,
            allowed_commands: None,
        }
    }
}

impl AgentConfig {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("loopsmith"))
    }

    /// Default config file location, whether or not it exists.
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load from `explicit` (which must exist) or from the default location
    /// (which may be absent), then apply environment overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `LOOPSMITH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(model) = get("LOOPSMITH_MODEL") {
            self.model = model;
        }
        if let Some(url) = get("LOOPSMITH_BASE_URL") {
            self.base_url = url;
        }
        if let Some(root) = get("LOOPSMITH_SANDBOX_ROOT") {
            self.sandbox_root = PathBuf::from(root);
        }
        if let Some(value) = get("LOOPSMITH_MAX_TURNS") {
            self.max_turns = parse_number("LOOPSMITH_MAX_TURNS", &value)?;
        }
        if let Some(value) = get("LOOPSMITH_MAX_HOPS") {
            self.max_hops = parse_number("LOOPSMITH_MAX_HOPS", &value)?;
        }
        if let Some(value) = get("LOOPSMITH_SHELL_TIMEOUT_SECS") {
            self.shell_timeout_secs = parse_number("LOOPSMITH_SHELL_TIMEOUT_SECS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_history == 0 {
            bail!("max_history must be at least 1");
        }
        if self.max_hops == 0 {
            bail!("max_hops must be at least 1");
        }
        if self.max_turns == 0 {
            bail!("max_turns must be at least 1");
        }
        if self.shell_timeout_secs == 0 || self.test_timeout_secs == 0 {
            bail!("shell_timeout_secs and test_timeout_secs must be at least 1");
        }
        if self.test_command.trim().is_empty() {
            bail!("test_command must not be empty");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be between 0.0 and 2.0");
        }
        Ok(())
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer, got '{value}'"))
}

/// The model-service credential, if set to something non-blank.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}
