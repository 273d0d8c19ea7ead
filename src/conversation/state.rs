//! # Conversation Session Types
//!
//! Plain data shared between the turn controller, its collaborators and the
//! presentation layer: the turn state machine's states, the session token that
//! tags every asynchronous call, the per-turn record and the reply payload.

use crate::error::TurnError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Identifies one run of a conversation session.
///
/// Regenerated every time the session (re)starts. Every capture, transcription,
/// dispatch and playback call carries the token it was issued under, so results
/// that come back for an older run can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the session fell back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectingCause {
    /// Microphone permission was refused
    PermissionDenied,
    /// The arbitrator denied the lease
    MicrophoneBusy,
    /// The capture stream failed or could not be resumed
    DeviceLost,
    /// Subscribing to the completion watcher failed
    WatcherUnavailable,
    /// The completion watcher channel closed mid-session
    WatcherDisconnected,
    /// The bounded wait for a reply expired
    ReplyTimedOut,
}

impl ConnectingCause {
    /// Whether the UI should present a retry affordance that requires the user
    /// to change something (grant permission, stop dictation) first.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, ConnectingCause::PermissionDenied | ConnectingCause::MicrophoneBusy)
    }
}

impl From<&TurnError> for ConnectingCause {
    fn from(err: &TurnError) -> Self {
        match err {
            TurnError::PermissionDenied(_) => ConnectingCause::PermissionDenied,
            TurnError::MicrophoneBusy { .. } => ConnectingCause::MicrophoneBusy,
            TurnError::WatcherUnavailable(_) => ConnectingCause::WatcherUnavailable,
            TurnError::ReplyTimedOut { .. } => ConnectingCause::ReplyTimedOut,
            _ => ConnectingCause::DeviceLost,
        }
    }
}

/// The turn controller's state machine.
///
/// ## Transitions:
/// ```text
/// Idle → Establishing → Listening → Processing → AwaitingReply → Replying → Listening …
///   any state ──(capture / setup failure)──▶ Connecting ──start()──▶ Establishing
///   any state ──close()──▶ Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum TurnState {
    /// No microphone permission requested yet
    Idle,
    /// Permission requested, lease and capture being set up
    Establishing,
    /// Recording, waiting for the user to finish speaking
    Listening,
    /// Utterance captured, transcription in flight
    Processing,
    /// Message dispatched, waiting for the generated reply to be pushed
    AwaitingReply,
    /// Synthesized reply is playing
    Replying,
    /// Recoverable failure, the user may retry `start()`
    Connecting(ConnectingCause),
    /// Closed by the user; irreversible for this session
    Closed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Establishing => "establishing",
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::AwaitingReply => "awaiting_reply",
            TurnState::Replying => "replying",
            TurnState::Connecting(_) => "connecting",
            TurnState::Closed => "closed",
        }
    }

    /// Coarse indicator for the UI ("listening / thinking / speaking").
    pub fn indicator(&self) -> &'static str {
        match self {
            TurnState::Listening => "listening",
            TurnState::Processing | TurnState::AwaitingReply => "thinking",
            TurnState::Replying => "speaking",
            TurnState::Establishing | TurnState::Connecting(_) => "connecting",
            TurnState::Idle | TurnState::Closed => "idle",
        }
    }

    /// `start()` only does something from these states.
    pub fn accepts_start(&self) -> bool {
        matches!(self, TurnState::Idle | TurnState::Connecting(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TurnState::Closed)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Connecting(cause) => write!(f, "connecting({:?})", cause),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One listen → transcribe → dispatch → reply → speak cycle.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Per-message correlation id sent with the dispatch
    pub correlation_id: Uuid,
    pub user_text: String,
    pub assistant_reply_id: Option<String>,
    pub assistant_text: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(user_text: String) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            user_text,
            assistant_reply_id: None,
            assistant_text: None,
            started_at: Utc::now(),
        }
    }
}

/// "A new generated reply exists" - the only event the completion watcher delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyEvent {
    pub reply_id: String,
    pub text: String,
}

impl ReplyEvent {
    pub fn new(reply_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_id: reply_id.into(),
            text: text.into(),
        }
    }
}

/// Side-channel notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum TurnNotice {
    /// The user's utterance was transcribed and is being dispatched
    UserTurn { correlation_id: Uuid, text: String },
    /// A generated reply started playing
    ReplyStarted { reply_id: String, text: String },
    /// A recoverable failure was absorbed
    Error { error: TurnError },
}
