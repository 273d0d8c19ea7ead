//! # Audio Capture Module
//!
//! Turns the PCM stream a client pushes over the voice socket into finished
//! utterances for transcription.
//!
//! ## Key Components:
//! - **Processor**: PCM frame validation, format checks, level measurement
//! - **VAD**: two-phase voice activity / silence detection
//! - **Buffer**: bounded utterance buffer with WAV encoding
//! - **Capture**: the stream-fed `CaptureSession` used by conversations and dictation
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: configured (16kHz by default)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod capture;
pub mod processor;
pub mod vad;

pub use capture::{CaptureConfig, StreamCapture};
pub use processor::AudioFormat;
