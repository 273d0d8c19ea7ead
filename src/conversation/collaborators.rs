//! # Collaborator Contracts
//!
//! The turn controller orchestrates independently-failing resources it does not
//! implement itself. Each one is a trait so the application can plug in the real
//! stream/HTTP implementations and tests can plug in scripted fakes.
//!
//! ## Contracts:
//! - **CaptureSession**: microphone stream, recording, silence detection
//! - **Transcriber**: audio segment → text (empty on silence/noise)
//! - **Dispatcher**: fire-and-forget send of user text; the reply comes back via the watcher
//! - **Playback**: plays a synthesized reply and reports completion through a callback
//!
//! Every request that leaves the controller carries the [`SessionToken`] it was
//! issued under.

use crate::conversation::state::SessionToken;
use crate::error::TurnError;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Which feature a transcription or dispatch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    Conversation,
    Dictation,
}

impl VoiceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceMode::Conversation => "conversation",
            VoiceMode::Dictation => "dictation",
        }
    }
}

/// A finished utterance, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    /// Encoded audio (WAV container for the stream capture)
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_ms: u64,
}

impl AudioSegment {
    pub fn wav(bytes: Vec<u8>, duration_ms: u64) -> Self {
        Self {
            bytes,
            mime_type: "audio/wav".to_string(),
            duration_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duration_ms == 0
    }
}

// ----- Capture -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Silence that ends an utterance once voice has been detected
    pub silence_timeout_ms: u64,
}

/// Events a capture session emits after `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The recorder finished on its own (e.g. maximum utterance length) and produced audio
    Segment(AudioSegment),
    /// Voice was followed by the configured silence; call `stop_recording` to collect audio
    Silence,
    /// The stream failed
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureState {
    pub has_stream: bool,
    pub is_recording: bool,
}

#[async_trait]
pub trait CaptureSession: Send + Sync {
    /// Ask for access to the capture device.
    async fn request_permission(&self) -> Result<(), TurnError>;

    /// Configure detection and hand back the event stream for this session.
    /// Calling it again replaces the previous sink.
    fn initialize(&self, options: CaptureOptions) -> mpsc::UnboundedReceiver<CaptureEvent>;

    /// Begin buffering audio. Returns `false` if there is no live stream.
    async fn start_recording(&self) -> bool;

    /// Stop buffering and return what was recorded, if anything.
    async fn stop_recording(&self) -> Option<AudioSegment>;

    /// Re-arm the stream after the assistant finished speaking.
    async fn resume_after_playback(&self) -> Result<(), TurnError>;

    /// Stop everything and drop the event sink. Idempotent.
    fn force_cleanup(&self);

    fn state(&self) -> CaptureState;
}

// ----- Transcription -----

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptionOptions {
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: AudioSegment,
    pub conversation_id: String,
    pub options: TranscriptionOptions,
    pub mode: VoiceMode,
    pub session_token: SessionToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    /// Token echoed back from the request
    pub session_token: SessionToken,
}

impl Transcript {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript, TurnError>;
}

// ----- Dispatch -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub text: String,
    pub correlation_id: Uuid,
    pub mode: VoiceMode,
    pub session_token: SessionToken,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send the user's text. Success only means the generator accepted it.
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TurnError>;
}

// ----- Playback -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Interrupted,
}

/// The completion callback handed to [`Playback::speak`].
///
/// Exactly one outcome is delivered: either through `complete`, or as
/// `Interrupted` when the callback is dropped unused.
#[derive(Debug)]
pub struct PlaybackCallback {
    tx: Option<oneshot::Sender<PlaybackOutcome>>,
}

/// The controller's end of a [`PlaybackCallback`].
#[derive(Debug)]
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackCallback {
    pub fn channel() -> (PlaybackCallback, PlaybackCompletion) {
        let (tx, rx) = oneshot::channel();
        (PlaybackCallback { tx: Some(tx) }, PlaybackCompletion { rx })
    }

    pub fn complete(mut self, outcome: PlaybackOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for PlaybackCallback {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(PlaybackOutcome::Interrupted);
        }
    }
}

impl PlaybackCompletion {
    pub async fn wait(self) -> PlaybackOutcome {
        self.rx.await.unwrap_or(PlaybackOutcome::Interrupted)
    }
}

#[derive(Debug)]
pub struct SpeakRequest {
    pub conversation_id: String,
    pub reply_id: String,
    pub text: String,
    pub session_token: SessionToken,
    pub on_complete: PlaybackCallback,
}

#[async_trait]
pub trait Playback: Send + Sync {
    /// Start speaking `request.text`. Completion is reported via `request.on_complete`.
    async fn speak(&self, request: SpeakRequest) -> Result<(), TurnError>;

    /// Stop every sound immediately.
    fn stop_all(&self);

    /// Release audio-output resources between replies.
    fn suspend(&self);

    /// Re-acquire audio-output resources before a reply.
    async fn resume(&self);
}
