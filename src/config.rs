use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;
use crate::usage::UsageLimits;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
    pub live: LiveConfig,
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    /// Samples per capture frame sent to the endpoint
    pub frame_samples: usize,
    pub capture_buffer_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub session_secs: u64,
    pub daily_secs: u64,
    pub accrual_tick_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Websocket,
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    pub transport: TransportKind,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub nats_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    pub store_path: PathBuf,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONCIERGE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn usage_limits(&self) -> Result<UsageLimits> {
        let limits = UsageLimits {
            session: Duration::from_secs(self.limits.session_secs),
            daily: Duration::from_secs(self.limits.daily_secs),
            accrual_tick: Duration::from_secs(self.limits.accrual_tick_secs),
        };
        limits.validate().context("Invalid [limits] section")?;
        Ok(limits)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            output_channels: self.audio.output_channels,
            frame_samples: self.audio.frame_samples,
            capture_buffer_ms: self.audio.capture_buffer_ms,
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
        }
    }

    /// API key read from the configured environment variable, if set and non-empty
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.live.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}
