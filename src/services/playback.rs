//! # Socket Playback
//!
//! [`Playback`] for a browser client: replies are synthesized server-side and the
//! resulting audio URL is pushed down the voice socket as a `play_reply` message.
//! The client plays it and answers `playback_complete` with the same reply id.
//!
//! Only one reply is pending at a time. A completion naming any other reply id
//! is ignored, so a superseded playback can never finish the current one.

use crate::conversation::collaborators::{Playback, PlaybackCallback, PlaybackOutcome, SpeakRequest};
use crate::conversation::state::SessionToken;
use crate::error::TurnError;
use crate::services::synthesis::SpeechSynthesizer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Instructions for the client's audio element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCommand {
    Play {
        reply_id: String,
        text: String,
        audio_url: String,
    },
    Stop,
}

struct PendingReply {
    reply_id: String,
    session_token: SessionToken,
    callback: PlaybackCallback,
}

pub struct SocketPlayback {
    synthesizer: Arc<SpeechSynthesizer>,
    commands: mpsc::UnboundedSender<PlaybackCommand>,
    pending: Mutex<Option<PendingReply>>,
    suspended: AtomicBool,
}

impl SocketPlayback {
    pub fn new(
        synthesizer: Arc<SpeechSynthesizer>,
        commands: mpsc::UnboundedSender<PlaybackCommand>,
    ) -> Self {
        Self {
            synthesizer,
            commands,
            pending: Mutex::new(None),
            suspended: AtomicBool::new(true),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingReply>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The client finished playing `reply_id`. Returns `false` if that reply is
    /// not the one pending.
    pub fn complete(&self, reply_id: &str) -> bool {
        let finished = {
            let mut pending = self.pending();
            match pending.as_ref() {
                Some(reply) if reply.reply_id == reply_id => pending.take(),
                _ => None,
            }
        };

        match finished {
            Some(reply) => {
                debug!(%reply_id, session_token = %reply.session_token, "Client finished playback");
                reply.callback.complete(PlaybackOutcome::Finished);
                true
            }
            None => {
                debug!(%reply_id, "Playback completion for a reply that is not playing");
                false
            }
        }
    }

    pub fn pending_reply_id(&self) -> Option<String> {
        self.pending().as_ref().map(|reply| reply.reply_id.clone())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Playback for SocketPlayback {
    async fn speak(&self, request: SpeakRequest) -> Result<(), TurnError> {
        let audio_url = self
            .synthesizer
            .synthesize(&request.conversation_id, &request.text)
            .await?;

        let superseded = self.pending().replace(PendingReply {
            reply_id: request.reply_id.clone(),
            session_token: request.session_token,
            callback: request.on_complete,
        });
        if let Some(old) = superseded {
            debug!(reply_id = %old.reply_id, "Pending playback superseded");
        }

        let sent = self.commands.send(PlaybackCommand::Play {
            reply_id: request.reply_id.clone(),
            text: request.text,
            audio_url,
        });
        if sent.is_err() {
            self.pending().take();
            return Err(TurnError::Playback("client connection is gone".to_string()));
        }

        info!(
            conversation_id = %request.conversation_id,
            reply_id = %request.reply_id,
            "Reply sent to client for playback"
        );
        Ok(())
    }

    fn stop_all(&self) {
        // Dropping the callback reports Interrupted
        let interrupted = self.pending().take();
        if interrupted.is_some() {
            let _ = self.commands.send(PlaybackCommand::Stop);
        }
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::collaborators::PlaybackCompletion;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn synthesizer(server: &MockServer, success: bool) -> Arc<SpeechSynthesizer> {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": success,
                "audioUrl": "https://cdn.example/reply.mp3"
            })))
            .mount(server)
            .await;
        Arc::new(SpeechSynthesizer::new(
            reqwest::Client::new(),
            server.uri(),
            "Puck".to_string(),
            None,
        ))
    }

    fn speak_request(reply_id: &str) -> (SpeakRequest, PlaybackCompletion) {
        let (on_complete, completion) = PlaybackCallback::channel();
        (
            SpeakRequest {
                conversation_id: "chat-1".to_string(),
                reply_id: reply_id.to_string(),
                text: "Sure thing".to_string(),
                session_token: SessionToken::new(),
                on_complete,
            },
            completion,
        )
    }

    #[tokio::test]
    async fn test_speak_sends_play_and_completes_on_matching_id() {
        let server = MockServer::start().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = SocketPlayback::new(synthesizer(&server, true).await, tx);

        let (request, completion) = speak_request("r1");
        playback.speak(request).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(PlaybackCommand::Play {
                reply_id: "r1".to_string(),
                text: "Sure thing".to_string(),
                audio_url: "https://cdn.example/reply.mp3".to_string(),
            })
        );

        assert!(!playback.complete("other"));
        assert_eq!(playback.pending_reply_id().as_deref(), Some("r1"));
        assert!(playback.complete("r1"));
        assert_eq!(completion.wait().await, PlaybackOutcome::Finished);
        assert!(!playback.complete("r1"));
    }

    #[tokio::test]
    async fn test_stop_all_interrupts_pending_reply() {
        let server = MockServer::start().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = SocketPlayback::new(synthesizer(&server, true).await, tx);

        let (request, completion) = speak_request("r1");
        playback.speak(request).await.unwrap();
        rx.recv().await;

        playback.stop_all();
        assert_eq!(rx.recv().await, Some(PlaybackCommand::Stop));
        assert_eq!(completion.wait().await, PlaybackOutcome::Interrupted);

        // Nothing pending: no second stop
        playback.stop_all();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_synthesis_sends_nothing() {
        let server = MockServer::start().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = SocketPlayback::new(synthesizer(&server, false).await, tx);

        let (request, _completion) = speak_request("r1");
        assert!(matches!(playback.speak(request).await, Err(TurnError::Playback(_))));
        assert!(rx.try_recv().is_err());
        assert!(playback.pending_reply_id().is_none());
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let server = MockServer::start().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let playback = SocketPlayback::new(synthesizer(&server, true).await, tx);

        assert!(playback.is_suspended());
        playback.resume().await;
        assert!(!playback.is_suspended());
        playback.suspend();
        assert!(playback.is_suspended());
    }
}
