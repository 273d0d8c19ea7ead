//! # Speech Synthesis
//!
//! Turns reply text into a playable audio URL. The synthesis endpoint stores the
//! rendered audio and answers `{"success": true, "audioUrl": "..."}`; the client
//! fetches and plays that URL itself.
//!
//! Markdown in generated replies reads badly aloud, so text is sanitized first
//! (see [`sanitize_text`]).

use crate::error::TurnError;
use crate::services::{authorize, describe_failure};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct SpeechSynthesizer {
    client: reqwest::Client,
    url: String,
    voice: String,
    api_key: Option<String>,
}

impl SpeechSynthesizer {
    /// `client` should carry the synthesis timeout; rendering is much slower
    /// than the other calls.
    pub fn new(client: reqwest::Client, url: String, voice: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            voice,
            api_key,
        }
    }

    /// Render `text` and return the URL of the audio.
    pub async fn synthesize(&self, conversation_id: &str, text: &str) -> Result<String, TurnError> {
        let sanitized = sanitize_text(text);
        if sanitized.is_empty() {
            return Err(TurnError::Playback("nothing to speak after sanitizing".to_string()));
        }

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .json(&json!({
                "chat_id": conversation_id,
                "text": sanitized,
                "voice": self.voice,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TurnError::Playback("speech synthesis timed out".to_string())
                } else {
                    TurnError::Playback(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TurnError::Playback(format!(
                "synthesis failed: {}",
                describe_failure(response).await
            )));
        }

        let parsed: SynthesisResponse = response
            .json()
            .await
            .map_err(|e| TurnError::Playback(format!("invalid synthesis response: {}", e)))?;

        match parsed.audio_url {
            Some(url) if parsed.success && !url.is_empty() => {
                debug!(conversation_id, chars = sanitized.len(), "Speech synthesized");
                Ok(url)
            }
            _ => Err(TurnError::Playback(
                parsed
                    .error
                    .unwrap_or_else(|| "synthesis returned no audio".to_string()),
            )),
        }
    }
}

/// Strip markdown that should not be read aloud.
///
/// Fenced code blocks go entirely, inline backticks are dropped, `# * _ >`
/// become spaces, and runs of whitespace collapse to one space.
pub fn sanitize_text(input: &str) -> String {
    let mut text = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        match after_open.find("```") {
            Some(close) => {
                text.push_str(&rest[..open]);
                text.push(' ');
                rest = &after_open[close + 3..];
            }
            None => break,
        }
    }
    text.push_str(rest);

    let text: String = text
        .chars()
        .filter(|c| *c != '`')
        .map(|c| if matches!(c, '#' | '*' | '_' | '>') { ' ' } else { c })
        .collect();

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_sanitize_markdown() {
        assert_eq!(
            sanitize_text("# Title\n\nUse **bold** and `code`:\n```rust\nfn main() {}\n```\n> quoted_text"),
            "Title Use bold and code: quoted text"
        );
        assert_eq!(sanitize_text("  plain   words \n"), "plain words");
        assert_eq!(sanitize_text("```only code```"), "");
    }

    #[test]
    fn test_unterminated_fence_keeps_text() {
        assert_eq!(sanitize_text("before ```after"), "before after");
    }

    #[tokio::test]
    async fn test_synthesize_returns_audio_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/text-to-speech"))
            .and(body_partial_json(json!({
                "chat_id": "chat-1",
                "text": "Hello world",
                "voice": "Puck"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "audioUrl": "https://cdn.example/reply.mp3"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let synthesizer = SpeechSynthesizer::new(
            reqwest::Client::new(),
            format!("{}/text-to-speech", server.uri()),
            "Puck".to_string(),
            None,
        );
        let url = synthesizer.synthesize("chat-1", "**Hello** world").await.unwrap();
        assert_eq!(url, "https://cdn.example/reply.mp3");
    }

    #[tokio::test]
    async fn test_unsuccessful_synthesis_is_playback_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "voice not available"
            })))
            .mount(&server)
            .await;

        let synthesizer =
            SpeechSynthesizer::new(reqwest::Client::new(), server.uri(), "Puck".to_string(), None);
        assert_eq!(
            synthesizer.synthesize("chat-1", "hi").await,
            Err(TurnError::Playback("voice not available".to_string()))
        );
    }

    #[tokio::test]
    async fn test_slow_synthesis_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"success": true, "audioUrl": "late"})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let synthesizer = SpeechSynthesizer::new(client, server.uri(), "Puck".to_string(), None);
        assert_eq!(
            synthesizer.synthesize("chat-1", "hi").await,
            Err(TurnError::Playback("speech synthesis timed out".to_string()))
        );
    }
}
