//! # Dictation
//!
//! One-shot voice input for a text field: record a single utterance, transcribe
//! it, hand the text back. It competes with conversations for the microphone, so
//! it goes through the same [`MicrophoneArbitrator`] under [`OwnerTag::Dictation`].
//!
//! The lease is released and the capture cleaned up on every exit path, including
//! cancellation, by a guard that lives for the duration of [`DictationSession::run`].

use crate::arbitrator::{MicrophoneArbitrator, MicrophoneLease, OwnerTag};
use crate::conversation::collaborators::{
    CaptureEvent, CaptureOptions, CaptureSession, Transcriber, TranscriptionOptions,
    TranscriptionRequest, VoiceMode,
};
use crate::conversation::state::SessionToken;
use crate::error::TurnError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DictationSession {
    context_id: String,
    arbitrator: MicrophoneArbitrator,
    capture: Arc<dyn CaptureSession>,
    transcriber: Arc<dyn Transcriber>,
    silence_timeout_ms: u64,
    language: Option<String>,
}

struct LeaseGuard<'a> {
    arbitrator: &'a MicrophoneArbitrator,
    capture: &'a dyn CaptureSession,
    lease: MicrophoneLease,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.capture.force_cleanup();
        self.arbitrator.release_lease(&self.lease);
    }
}

impl DictationSession {
    /// `context_id` names what the text is for (usually the conversation the
    /// text field belongs to) and is passed through to transcription.
    pub fn new(
        context_id: impl Into<String>,
        arbitrator: MicrophoneArbitrator,
        capture: Arc<dyn CaptureSession>,
        transcriber: Arc<dyn Transcriber>,
        silence_timeout_ms: u64,
        language: Option<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            arbitrator,
            capture,
            transcriber,
            silence_timeout_ms,
            language,
        }
    }

    /// Record one utterance and return its transcript (possibly empty).
    ///
    /// Fails with `MicrophoneBusy` while a conversation holds the microphone and
    /// with `Closed` if `cancel` fires first.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<String, TurnError> {
        let lease = self
            .arbitrator
            .acquire(OwnerTag::Dictation)
            .map_err(|denied| TurnError::MicrophoneBusy {
                holder: denied.held_by,
            })?;
        let _guard = LeaseGuard {
            arbitrator: &self.arbitrator,
            capture: self.capture.as_ref(),
            lease,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Closed),
            permission = self.capture.request_permission() => permission?,
        }

        let mut events = self.capture.initialize(CaptureOptions {
            silence_timeout_ms: self.silence_timeout_ms,
        });
        if !self.capture.start_recording().await {
            return Err(TurnError::DeviceLost("capture stream is not available".to_string()));
        }
        debug!(context_id = %self.context_id, "Dictation recording");

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Closed),
            event = events.recv() => event,
        };
        let segment = match event {
            Some(CaptureEvent::Silence) => self.capture.stop_recording().await,
            Some(CaptureEvent::Segment(segment)) => Some(segment),
            Some(CaptureEvent::Error(msg)) => {
                warn!(context_id = %self.context_id, error = %msg, "Dictation capture failed");
                return Err(TurnError::DeviceLost(msg));
            }
            None => return Err(TurnError::DeviceLost("capture stream closed".to_string())),
        };

        let Some(segment) = segment.filter(|s| !s.is_empty()) else {
            return Ok(String::new());
        };

        let request = TranscriptionRequest {
            audio: segment,
            conversation_id: self.context_id.clone(),
            options: TranscriptionOptions {
                language: self.language.clone(),
            },
            mode: VoiceMode::Dictation,
            session_token: SessionToken::new(),
        };
        let transcript = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Closed),
            result = self.transcriber.transcribe(request) => result?,
        };

        let text = transcript.text.trim().to_string();
        info!(context_id = %self.context_id, chars = text.len(), "Dictation transcribed");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settle, FakeCapture, FakeTranscriber};

    struct Harness {
        arbitrator: MicrophoneArbitrator,
        capture: Arc<FakeCapture>,
        transcriber: Arc<FakeTranscriber>,
        dictation: DictationSession,
    }

    fn harness() -> Harness {
        let arbitrator = MicrophoneArbitrator::new();
        let capture = Arc::new(FakeCapture::new());
        let transcriber = Arc::new(FakeTranscriber::new());
        let dictation = DictationSession::new(
            "chat-1",
            arbitrator.clone(),
            capture.clone(),
            transcriber.clone(),
            1500,
            None,
        );
        Harness {
            arbitrator,
            capture,
            transcriber,
            dictation,
        }
    }

    #[tokio::test]
    async fn test_dictation_transcribes_one_utterance() {
        let h = harness();
        h.transcriber.respond_with("  buy milk ");

        let dictation = h.dictation.clone();
        let task = tokio::spawn(async move { dictation.run(&CancellationToken::new()).await });
        settle().await;

        assert_eq!(h.arbitrator.holder(), Some(OwnerTag::Dictation));
        assert_eq!(h.capture.silence_timeout_ms(), Some(1500));
        h.capture.emit_silence();

        assert_eq!(task.await.unwrap(), Ok("buy milk".to_string()));
        assert_eq!(h.transcriber.modes(), vec![VoiceMode::Dictation]);
        assert_eq!(h.arbitrator.holder(), None);
        assert_eq!(h.capture.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn test_dictation_denied_while_conversation_listens() {
        let h = harness();
        let conversation = h.arbitrator.acquire(OwnerTag::Conversation).unwrap();

        let result = h.dictation.run(&CancellationToken::new()).await;
        assert_eq!(
            result,
            Err(TurnError::MicrophoneBusy {
                holder: OwnerTag::Conversation
            })
        );
        assert_eq!(h.capture.permission_requests(), 0);
        assert!(h.arbitrator.is_held(&conversation));
    }

    #[tokio::test]
    async fn test_failures_release_the_microphone() {
        let h = harness();
        h.capture.deny_permission();
        let result = h.dictation.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TurnError::PermissionDenied(_))));
        assert_eq!(h.arbitrator.holder(), None);

        let h = harness();
        let dictation = h.dictation.clone();
        let task = tokio::spawn(async move { dictation.run(&CancellationToken::new()).await });
        settle().await;
        h.capture.emit_error("device unplugged");
        assert_eq!(
            task.await.unwrap(),
            Err(TurnError::DeviceLost("device unplugged".to_string()))
        );
        assert_eq!(h.arbitrator.holder(), None);
        assert!(h.arbitrator.acquire(OwnerTag::Conversation).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_dictation() {
        let h = harness();
        let cancel = CancellationToken::new();

        let dictation = h.dictation.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { dictation.run(&token).await });
        settle().await;

        cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(TurnError::Closed));
        assert_eq!(h.arbitrator.holder(), None);
        assert!(h.transcriber.modes().is_empty());
    }

    #[tokio::test]
    async fn test_lost_stream_is_device_error() {
        let h = harness();
        h.capture.lose_stream();
        let result = h.dictation.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TurnError::DeviceLost(_))));
        assert_eq!(h.arbitrator.holder(), None);
    }
}
