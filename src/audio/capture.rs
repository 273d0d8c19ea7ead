//! # Stream Capture
//!
//! [`CaptureSession`] implementation fed by the voice socket. The browser owns the
//! physical microphone; it tells us whether access was granted and then streams
//! PCM frames, which are buffered only while recording.
//!
//! ## Client Signals:
//! - `microphone_ready`: permission granted, stream live (format validated)
//! - `microphone_denied`: permission refused
//! - `microphone_lost`: the stream ended (device unplugged, tab muted, ...)
//!
//! ## Events:
//! While recording, every frame goes through the [`VoiceActivityDetector`]. Sustained
//! silence after speech emits [`CaptureEvent::Silence`]; reaching the utterance limit
//! stops recording and emits [`CaptureEvent::Segment`] directly.

use crate::audio::buffer::UtteranceBuffer;
use crate::audio::processor::{check_format, decode_frame, AudioFormat};
use crate::audio::vad::{VadConfig, VadDecision, VoiceActivityDetector};
use crate::conversation::collaborators::{
    AudioSegment, CaptureEvent, CaptureOptions, CaptureSession, CaptureState,
};
use crate::error::TurnError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capture tuning derived from the `audio` config section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConfig {
    pub format: AudioFormat,
    pub max_utterance_ms: u64,
    pub voice_start_threshold: f32,
    pub voice_start_ms: u64,
    pub silence_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            max_utterance_ms: 30_000,
            voice_start_threshold: 0.05,
            voice_start_ms: 250,
            silence_threshold: 0.02,
        }
    }
}

impl CaptureConfig {
    fn vad_config(&self, silence_timeout_ms: u64) -> VadConfig {
        VadConfig {
            sample_rate: self.format.sample_rate,
            voice_start_threshold: self.voice_start_threshold,
            voice_start_ms: self.voice_start_ms,
            silence_threshold: self.silence_threshold,
            silence_timeout_ms,
        }
    }
}

/// What the client last said about microphone access.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionState {
    Pending,
    Granted(AudioFormat),
    Denied(String),
}

struct Recorder {
    has_stream: bool,
    recording: bool,
    buffer: UtteranceBuffer,
    vad: VoiceActivityDetector,
    sink: Option<mpsc::UnboundedSender<CaptureEvent>>,
}

impl Recorder {
    fn emit(&self, event: CaptureEvent) {
        if let Some(sink) = self.sink.as_ref() {
            let _ = sink.send(event);
        }
    }
}

/// Capture session for one client connection. Cheap to clone.
#[derive(Clone)]
pub struct StreamCapture {
    config: CaptureConfig,
    recorder: Arc<Mutex<Recorder>>,
    permission: Arc<watch::Sender<PermissionState>>,
}

impl StreamCapture {
    pub fn new(config: CaptureConfig) -> Self {
        let (permission, _) = watch::channel(PermissionState::Pending);
        Self {
            recorder: Arc::new(Mutex::new(Recorder {
                has_stream: false,
                recording: false,
                buffer: UtteranceBuffer::new(config.format, config.max_utterance_ms),
                vad: VoiceActivityDetector::new(config.vad_config(2000)),
                sink: None,
            })),
            permission: Arc::new(permission),
            config,
        }
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn permission(&self) -> PermissionState {
        self.permission.borrow().clone()
    }

    /// The client granted access and its stream is live.
    pub fn microphone_ready(&self, declared: AudioFormat) -> Result<(), String> {
        check_format(&self.config.format, &declared)?;
        self.recorder().has_stream = true;
        self.permission.send_replace(PermissionState::Granted(declared));
        info!(sample_rate = declared.sample_rate, "Client microphone ready");
        Ok(())
    }

    pub fn microphone_denied(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.recorder().has_stream = false;
        warn!(%reason, "Client microphone denied");
        self.permission.send_replace(PermissionState::Denied(reason));
    }

    /// The client's stream ended. A recording in progress becomes a device error.
    pub fn microphone_lost(&self) {
        let mut recorder = self.recorder();
        let was_recording = recorder.recording;
        recorder.has_stream = false;
        recorder.recording = false;
        recorder.buffer.clear();
        if was_recording {
            recorder.emit(CaptureEvent::Error("microphone stream ended".to_string()));
        }
        drop(recorder);

        self.permission.send_replace(PermissionState::Pending);
        warn!(was_recording, "Client microphone lost");
    }

    /// Push one binary frame from the client.
    pub fn push_frame(&self, data: &[u8]) -> Result<(), String> {
        let samples = decode_frame(data)?;

        let mut recorder = self.recorder();
        if !recorder.has_stream {
            return Err("Microphone is not ready".to_string());
        }
        if !recorder.recording {
            return Ok(());
        }

        let full = recorder.buffer.append(&samples);
        if full {
            recorder.recording = false;
            if let Some(segment) = recorder.buffer.take_segment() {
                debug!(duration_ms = segment.duration_ms, "Utterance limit reached");
                recorder.emit(CaptureEvent::Segment(segment));
            }
            return Ok(());
        }

        if recorder.vad.process(&samples) == VadDecision::SilenceDetected {
            debug!(buffered_ms = recorder.buffer.duration_ms(), "Silence detected");
            recorder.emit(CaptureEvent::Silence);
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureSession for StreamCapture {
    async fn request_permission(&self) -> Result<(), TurnError> {
        let mut answers = self.permission.subscribe();
        let answer = answers
            .wait_for(|state| *state != PermissionState::Pending)
            .await
            .map(|state| state.clone());

        match answer {
            Ok(PermissionState::Granted(_)) => Ok(()),
            Ok(PermissionState::Denied(reason)) => Err(TurnError::PermissionDenied(reason)),
            _ => Err(TurnError::PermissionDenied("permission request abandoned".to_string())),
        }
    }

    fn initialize(&self, options: CaptureOptions) -> mpsc::UnboundedReceiver<CaptureEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut recorder = self.recorder();
        recorder.sink = Some(tx);
        recorder.vad = VoiceActivityDetector::new(self.config.vad_config(options.silence_timeout_ms));
        rx
    }

    async fn start_recording(&self) -> bool {
        let mut recorder = self.recorder();
        if !recorder.has_stream {
            return false;
        }
        recorder.buffer.clear();
        recorder.vad.reset();
        recorder.recording = true;
        true
    }

    async fn stop_recording(&self) -> Option<AudioSegment> {
        let mut recorder = self.recorder();
        recorder.recording = false;
        recorder.buffer.take_segment()
    }

    async fn resume_after_playback(&self) -> Result<(), TurnError> {
        let mut recorder = self.recorder();
        if !recorder.has_stream {
            return Err(TurnError::DeviceLost("microphone stream is gone".to_string()));
        }
        // Drop anything picked up while the reply was playing
        recorder.buffer.clear();
        Ok(())
    }

    fn force_cleanup(&self) {
        let mut recorder = self.recorder();
        recorder.recording = false;
        recorder.buffer.clear();
        recorder.vad.reset();
        recorder.sink = None;
    }

    fn state(&self) -> CaptureState {
        let recorder = self.recorder();
        CaptureState {
            has_stream: recorder.has_stream,
            is_recording: recorder.recording,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(level: i16, samples: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            data.extend_from_slice(&level.to_le_bytes());
        }
        data
    }

    fn ready_capture(config: CaptureConfig) -> StreamCapture {
        let capture = StreamCapture::new(config);
        capture.microphone_ready(AudioFormat::default()).unwrap();
        capture
    }

    #[tokio::test]
    async fn test_permission_follows_client_signal() {
        let capture = StreamCapture::new(CaptureConfig::default());
        let waiter = {
            let capture = capture.clone();
            tokio::spawn(async move { capture.request_permission().await })
        };

        capture.microphone_denied("blocked in browser settings");
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TurnError::PermissionDenied(_))));

        capture.microphone_ready(AudioFormat::default()).unwrap();
        assert!(capture.request_permission().await.is_ok());
    }

    #[test]
    fn test_rejects_unsupported_format() {
        let capture = StreamCapture::new(CaptureConfig::default());
        assert!(capture.microphone_ready(AudioFormat::new(48000, 2, 16)).is_err());
        assert_eq!(capture.permission(), PermissionState::Pending);
    }

    #[tokio::test]
    async fn test_silence_event_after_speech() {
        let capture = ready_capture(CaptureConfig::default());
        let mut events = capture.initialize(CaptureOptions {
            silence_timeout_ms: 500,
        });
        assert!(capture.start_recording().await);

        // 300ms speech, then 500ms silence in 100ms frames
        for _ in 0..3 {
            capture.push_frame(&frame(8000, 1600)).unwrap();
        }
        for _ in 0..5 {
            capture.push_frame(&frame(0, 1600)).unwrap();
        }

        assert_eq!(events.recv().await, Some(CaptureEvent::Silence));

        let segment = capture.stop_recording().await.unwrap();
        assert_eq!(segment.duration_ms, 800);
        assert!(!capture.state().is_recording);
    }

    #[tokio::test]
    async fn test_frames_ignored_when_not_recording() {
        let capture = ready_capture(CaptureConfig::default());
        let _events = capture.initialize(CaptureOptions {
            silence_timeout_ms: 2000,
        });

        capture.push_frame(&frame(8000, 1600)).unwrap();
        assert!(capture.stop_recording().await.is_none());
    }

    #[tokio::test]
    async fn test_utterance_limit_emits_segment() {
        let config = CaptureConfig {
            max_utterance_ms: 200,
            ..CaptureConfig::default()
        };
        let capture = ready_capture(config);
        let mut events = capture.initialize(CaptureOptions {
            silence_timeout_ms: 2000,
        });
        capture.start_recording().await;

        capture.push_frame(&frame(8000, 1600)).unwrap();
        capture.push_frame(&frame(8000, 1600)).unwrap();

        match events.recv().await {
            Some(CaptureEvent::Segment(segment)) => assert_eq!(segment.duration_ms, 200),
            other => panic!("expected segment, got {:?}", other),
        }
        assert!(!capture.state().is_recording);
    }

    #[tokio::test]
    async fn test_lost_stream_while_recording_is_an_error() {
        let capture = ready_capture(CaptureConfig::default());
        let mut events = capture.initialize(CaptureOptions {
            silence_timeout_ms: 2000,
        });
        capture.start_recording().await;

        capture.microphone_lost();

        assert!(matches!(events.recv().await, Some(CaptureEvent::Error(_))));
        assert!(!capture.state().has_stream);
        assert!(!capture.start_recording().await);
        assert!(capture.resume_after_playback().await.is_err());
        assert!(capture.push_frame(&frame(0, 10)).is_err());
    }

    #[tokio::test]
    async fn test_force_cleanup_is_idempotent() {
        let capture = ready_capture(CaptureConfig::default());
        let mut events = capture.initialize(CaptureOptions {
            silence_timeout_ms: 2000,
        });
        capture.start_recording().await;
        capture.push_frame(&frame(8000, 1600)).unwrap();

        capture.force_cleanup();
        capture.force_cleanup();

        assert_eq!(events.recv().await, None);
        assert!(capture.stop_recording().await.is_none());
        // The stream itself survives cleanup
        assert!(capture.state().has_stream);
    }
}
