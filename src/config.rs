//! Engine configuration: defaults, builder setters and TOML loading
use super::error::ConfigError;
use super::executor::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub cooldown: Duration,
    pub pending_ttl: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub guard_history_capacity: usize,
    pub resolved_token_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            cooldown: Duration::from_secs(2),
            pending_ttl: Duration::from_secs(5 * 60),
            max_attempts: retry.max_attempts,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            guard_history_capacity: 1024,
            resolved_token_capacity: 1024,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

// Shape of the config file. Durations are given in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cooldown_ms: Option<u64>,
    pending_ttl_ms: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    guard_history_capacity: Option<usize>,
    resolved_token_capacity: Option<usize>,
    sweep_interval_ms: Option<u64>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
    pub fn set_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }
    pub fn set_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
    pub fn set_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }
    pub fn set_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
    pub fn set_guard_history_capacity(mut self, capacity: usize) -> Self {
        self.guard_history_capacity = capacity;
        self
    }
    pub fn set_resolved_token_capacity(mut self, capacity: usize) -> Self {
        self.resolved_token_capacity = capacity;
        self
    }
    pub fn set_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::DelayOrder {
                base_ms: self.base_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        if self.pending_ttl.is_zero() {
            return Err(ConfigError::Zero("pending_ttl"));
        }
        if self.guard_history_capacity == 0 {
            return Err(ConfigError::Zero("guard_history_capacity"));
        }
        if self.resolved_token_capacity == 0 {
            return Err(ConfigError::Zero("resolved_token_capacity"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Zero("sweep_interval"));
        }
        Ok(())
    }

    /// Parses a TOML document; keys that are absent keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;
        let defaults = Self::default();
        let ms = |value: Option<u64>, default: Duration| {
            value.map_or(default, Duration::from_millis)
        };

        let config = Self {
            cooldown: ms(file.cooldown_ms, defaults.cooldown),
            pending_ttl: ms(file.pending_ttl_ms, defaults.pending_ttl),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: ms(file.base_delay_ms, defaults.base_delay),
            max_delay: ms(file.max_delay_ms, defaults.max_delay),
            guard_history_capacity: file
                .guard_history_capacity
                .unwrap_or(defaults.guard_history_capacity),
            resolved_token_capacity: file
                .resolved_token_capacity
                .unwrap_or(defaults.resolved_token_capacity),
            sweep_interval: ms(file.sweep_interval_ms, defaults.sweep_interval),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at `path`, falling back to defaults when it is missing
    /// or unusable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Self::default();
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Self::default()
            }
        }
    }
}
