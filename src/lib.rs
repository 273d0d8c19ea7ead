//! # Voice Turn Backend
//!
//! Server side of a hands-free voice conversation: capture the user's speech,
//! transcribe it, dispatch it to a response generator, wait for the generated
//! reply, play it back and listen again, while one microphone is shared between
//! conversations and dictation.
//!
//! ## Modules:
//! - **arbitrator**: exclusive microphone leases
//! - **audio**: stream-fed capture with voice activity detection
//! - **conversation**: the turn controller and its collaborator contracts
//! - **dictation**: one-shot voice input competing for the microphone
//! - **services**: HTTP and realtime implementations of the collaborators
//! - **websocket**: the `/ws/voice` actor binding a browser tab to all of the above
//! - **config**, **state**, **error**, **health**, **handlers**, **middleware**: the HTTP service around it

pub mod arbitrator;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod dictation;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod services;
pub mod state;
pub mod websocket;

#[cfg(test)]
mod test_support;
