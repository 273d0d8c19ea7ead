//! # Conversation Module
//!
//! The voice-conversation core: the turn state machine and the contracts of the
//! resources it coordinates.
//!
//! ## Components:
//! - **state**: turn states, session tokens, turn records and notices
//! - **collaborators**: capture, transcription, dispatch and playback contracts
//! - **watcher**: the push subscription that delivers generated replies
//! - **controller**: the [`TurnController`] itself

pub mod collaborators;
pub mod controller;
pub mod state;
pub mod watcher;

pub use collaborators::{
    AudioSegment, CaptureEvent, CaptureOptions, CaptureSession, CaptureState, Dispatcher, Playback,
    Transcriber, VoiceMode,
};
pub use controller::{Collaborators, ControllerConfig, StatsSnapshot, TurnController};
pub use state::{ConnectingCause, ReplyEvent, SessionToken, TurnNotice, TurnState};
pub use watcher::{CompletionWatcher, ReplyHub};
