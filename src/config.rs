//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nesting levels)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_CONVERSATION__REPLY_TIMEOUT_MS, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Runtime updates through `PUT /api/v1/config` apply to conversations opened
//! afterwards; running conversations keep the settings they started with.

use crate::audio::capture::CaptureConfig;
use crate::audio::processor::AudioFormat;
use crate::conversation::controller::ControllerConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub conversation: ConversationConfig,
    pub audio: AudioSettings,
    pub services: ServicesConfig,
    pub watcher: WatcherConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Turn controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Silence after speech that ends an utterance
    pub silence_timeout_ms: u64,
    /// Bound on waiting for a generated reply. Unset means wait indefinitely.
    #[serde(default)]
    pub reply_timeout_ms: Option<u64>,
    pub max_concurrent_conversations: usize,
}

/// Capture format and voice activity detection thresholds.
///
/// ## Thresholds:
/// Levels are frame RMS normalized to `[0, 1]`. Speech must stay above
/// `voice_start_threshold` for `voice_start_ms` before silence monitoring begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub max_utterance_ms: u64,
    pub voice_start_threshold: f32,
    pub voice_start_ms: u64,
    pub silence_threshold: f32,
}

/// External transcription, dispatch and synthesis endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub transcription_url: String,
    pub dispatch_url: String,
    pub synthesis_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub synthesis_timeout_ms: u64,
    #[serde(default)]
    pub language: Option<String>,
    pub voice: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherMode {
    /// Replies are POSTed to `/api/v1/conversations/{id}/replies`
    Webhook,
    /// Replies arrive over a realtime WebSocket subscription
    Realtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub mode: WatcherMode,
    #[serde(default)]
    pub realtime_url: Option<String>,
    pub max_reconnect_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            conversation: ConversationConfig {
                silence_timeout_ms: 2000,
                reply_timeout_ms: None,
                max_concurrent_conversations: 10,
            },
            audio: AudioSettings {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                max_utterance_ms: 30_000,
                voice_start_threshold: 0.05,
                voice_start_ms: 250,
                silence_threshold: 0.02,
            },
            services: ServicesConfig {
                transcription_url: "http://127.0.0.1:54321/functions/v1/speech-to-text".to_string(),
                dispatch_url: "http://127.0.0.1:54321/functions/v1/chat-send".to_string(),
                synthesis_url: "http://127.0.0.1:54321/functions/v1/text-to-speech".to_string(),
                api_key: None,
                request_timeout_ms: 15_000,
                synthesis_timeout_ms: 25_000,
                language: None,
                voice: "Puck".to_string(),
            },
            watcher: WatcherConfig {
                mode: WatcherMode::Webhook,
                realtime_url: None,
                max_reconnect_attempts: 5,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_CONVERSATION__REPLY_TIMEOUT_MS=45000`: Bound the reply wait
    /// - `APP_WATCHER__MODE=realtime`: Use the realtime watcher
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let conversation = &self.conversation;
        if conversation.silence_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Silence timeout must be greater than 0"));
        }
        if conversation.reply_timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("Reply timeout must be greater than 0 when set"));
        }
        if conversation.max_concurrent_conversations == 0 {
            return Err(anyhow::anyhow!("Max concurrent conversations must be greater than 0"));
        }

        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }
        if audio.channels != 1 || audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Unsupported audio format: only 16-bit mono PCM is supported"
            ));
        }
        if audio.max_utterance_ms == 0 {
            return Err(anyhow::anyhow!("Max utterance length must be greater than 0"));
        }
        for (name, value) in [
            ("voice_start_threshold", audio.voice_start_threshold),
            ("silence_threshold", audio.silence_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1", name));
            }
        }
        if audio.silence_threshold >= audio.voice_start_threshold {
            return Err(anyhow::anyhow!(
                "silence_threshold must be lower than voice_start_threshold"
            ));
        }

        if self.services.request_timeout_ms == 0 || self.services.synthesis_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Service timeouts must be greater than 0"));
        }

        if self.watcher.mode == WatcherMode::Realtime
            && self.watcher.realtime_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(anyhow::anyhow!("Realtime watcher mode requires watcher.realtime_url"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON change; for example
    /// `{"conversation": {"reply_timeout_ms": 45000}}` bounds the reply wait and
    /// leaves everything else alone. The result is validated before it is kept.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            silence_timeout_ms: self.conversation.silence_timeout_ms,
            reply_timeout_ms: self.conversation.reply_timeout_ms,
            language: self.services.language.clone(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            format: AudioFormat::new(self.audio.sample_rate, self.audio.channels, self.audio.bit_depth),
            max_utterance_ms: self.audio.max_utterance_ms,
            voice_start_threshold: self.audio.voice_start_threshold,
            voice_start_ms: self.audio.voice_start_ms,
            silence_threshold: self.audio.silence_threshold,
        }
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge key by key;
/// anything else (including `null`) replaces the base value.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}
