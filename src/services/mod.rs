//! # External Services
//!
//! Concrete collaborators backed by HTTP and WebSocket endpoints.
//!
//! ## Components:
//! - **transcription**: uploads an utterance, gets text back
//! - **dispatch**: sends the user's text to the response generator
//! - **synthesis**: turns reply text into a playable audio URL
//! - **playback**: plays synthesized replies through the client's voice socket
//! - **realtime**: WebSocket completion watcher with bounded reconnects
//!
//! Every outgoing HTTP request carries the configured API key both as an `apikey`
//! header and as a bearer token.

pub mod dispatch;
pub mod playback;
pub mod realtime;
pub mod synthesis;
pub mod transcription;

pub use dispatch::HttpDispatcher;
pub use playback::{PlaybackCommand, SocketPlayback};
pub use realtime::RealtimeWatcher;
pub use synthesis::SpeechSynthesizer;
pub use transcription::HttpTranscriber;

use crate::config::{AppConfig, WatcherMode};
use crate::conversation::watcher::{CompletionWatcher, ReplyHub};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// The shared, stateless collaborators every conversation uses.
///
/// Rebuilt when the configuration changes; conversations keep the set they were
/// opened with.
#[derive(Clone)]
pub struct ServiceClients {
    pub transcriber: Arc<HttpTranscriber>,
    pub dispatcher: Arc<HttpDispatcher>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub watcher: Arc<dyn CompletionWatcher>,
}

impl ServiceClients {
    pub fn from_config(config: &AppConfig, hub: &ReplyHub) -> Result<Self> {
        let services = &config.services;
        let api_key = services.api_key.clone();

        let client = build_client(services.request_timeout_ms)?;
        let synthesis_client = build_client(services.synthesis_timeout_ms)?;

        let watcher: Arc<dyn CompletionWatcher> = match config.watcher.mode {
            WatcherMode::Webhook => Arc::new(hub.clone()),
            WatcherMode::Realtime => {
                let url = config
                    .watcher
                    .realtime_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("Realtime watcher mode requires watcher.realtime_url"))?;
                Arc::new(RealtimeWatcher::new(
                    url,
                    api_key.clone(),
                    config.watcher.max_reconnect_attempts,
                ))
            }
        };

        Ok(Self {
            transcriber: Arc::new(HttpTranscriber::new(
                client.clone(),
                services.transcription_url.clone(),
                api_key.clone(),
            )),
            dispatcher: Arc::new(HttpDispatcher::new(
                client,
                services.dispatch_url.clone(),
                api_key.clone(),
            )),
            synthesizer: Arc::new(SpeechSynthesizer::new(
                synthesis_client,
                services.synthesis_url.clone(),
                services.voice.clone(),
                api_key,
            )),
            watcher,
        })
    }
}

fn build_client(timeout_ms: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()?;
    Ok(client)
}

/// Attach the API key, if one is configured.
pub(crate) fn authorize(
    request: reqwest::RequestBuilder,
    api_key: Option<&str>,
) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => request
            .header("apikey", key)
            .header("Authorization", format!("Bearer {}", key)),
        _ => request,
    }
}

/// Read a non-2xx response into a short error description.
pub(crate) async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {} - {}", status.as_u16(), body)
    }
}
