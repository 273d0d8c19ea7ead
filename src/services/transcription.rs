//! HTTP speech-to-text client.
//!
//! Uploads the utterance base64-encoded in a JSON body and reads back
//! `{"transcript": "..."}`. A missing or empty transcript is not an error; it
//! means the segment held no speech.

use crate::conversation::collaborators::{Transcriber, Transcript, TranscriptionRequest};
use crate::error::TurnError;
use crate::services::{authorize, describe_failure};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeBody<'a> {
    audio_data: String,
    mime_type: &'a str,
    #[serde(rename = "chat_id")]
    chat_id: &'a str,
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<&'a str>,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcript: Option<String>,
}

pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTranscriber {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self { client, url, api_key }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript, TurnError> {
        let body = TranscribeBody {
            audio_data: BASE64.encode(&request.audio.bytes),
            mime_type: &request.audio.mime_type,
            chat_id: &request.conversation_id,
            mode: request.mode.as_str(),
            language_code: request.options.language.as_deref(),
            session_id: request.session_token.to_string(),
        };

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|e| TurnError::Transcription(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TurnError::Transcription(describe_failure(response).await));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| TurnError::Transcription(format!("invalid response: {}", e)))?;

        let text = parsed.transcript.unwrap_or_default().trim().to_string();
        debug!(
            conversation_id = %request.conversation_id,
            chars = text.len(),
            duration_ms = request.audio.duration_ms,
            "Transcription received"
        );

        Ok(Transcript {
            text,
            session_token: request.session_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::collaborators::{AudioSegment, TranscriptionOptions, VoiceMode};
    use crate::conversation::state::SessionToken;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(token: SessionToken) -> TranscriptionRequest {
        TranscriptionRequest {
            audio: AudioSegment::wav(vec![1, 2, 3], 500),
            conversation_id: "chat-1".to_string(),
            options: TranscriptionOptions {
                language: Some("en-US".to_string()),
            },
            mode: VoiceMode::Conversation,
            session_token: token,
        }
    }

    fn transcriber(server: &MockServer) -> HttpTranscriber {
        HttpTranscriber::new(
            reqwest::Client::new(),
            format!("{}/speech-to-text", server.uri()),
            Some("test-key".to_string()),
        )
    }

    #[tokio::test]
    async fn test_transcribe_sends_audio_and_echoes_token() {
        let server = MockServer::start().await;
        let token = SessionToken::new();

        Mock::given(method("POST"))
            .and(path("/speech-to-text"))
            .and(header("apikey", "test-key"))
            .and(body_partial_json(json!({
                "audioData": "AQID",
                "mimeType": "audio/wav",
                "chat_id": "chat-1",
                "mode": "conversation",
                "languageCode": "en-US",
                "sessionId": token.to_string()
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transcript": "  what's the weather  "
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transcript = transcriber(&server).transcribe(request(token)).await.unwrap();
        assert_eq!(transcript.text, "what's the weather");
        assert_eq!(transcript.session_token, token);
    }

    #[tokio::test]
    async fn test_missing_transcript_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let transcript = transcriber(&server)
            .transcribe(request(SessionToken::new()))
            .await
            .unwrap();
        assert!(transcript.is_blank());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_transcription_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let result = transcriber(&server).transcribe(request(SessionToken::new())).await;
        match result {
            Err(TurnError::Transcription(msg)) => assert!(msg.contains("502")),
            other => panic!("expected transcription error, got {:?}", other),
        }
    }
}
