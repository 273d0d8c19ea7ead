//! Scripted in-memory collaborators for controller and dictation tests.

use crate::conversation::collaborators::{
    AudioSegment, CaptureEvent, CaptureOptions, CaptureSession, CaptureState, DispatchRequest,
    Dispatcher, Playback, PlaybackCallback, PlaybackOutcome, SpeakRequest, Transcriber, Transcript,
    TranscriptionRequest, VoiceMode,
};
use crate::conversation::state::{ReplyEvent, SessionToken, TurnState};
use crate::conversation::watcher::{CompletionWatcher, ReplySubscription, SubscriptionHandle};
use crate::error::TurnError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Let spawned tasks run to quiescence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

pub async fn wait_for_state(states: &mut watch::Receiver<TurnState>, target: TurnState) {
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", target))
        .expect("state channel closed");
}

// ----- capture -----

pub struct FakeCapture {
    permission_denied: AtomicBool,
    stream_live: AtomicBool,
    recording: AtomicBool,
    sink: Mutex<Option<mpsc::UnboundedSender<CaptureEvent>>>,
    options: Mutex<Option<CaptureOptions>>,
    permission_requests: AtomicUsize,
    starts: AtomicUsize,
    resumes: AtomicUsize,
    cleanups: AtomicUsize,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            permission_denied: AtomicBool::new(false),
            stream_live: AtomicBool::new(true),
            recording: AtomicBool::new(false),
            sink: Mutex::new(None),
            options: Mutex::new(None),
            permission_requests: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn deny_permission(&self) {
        self.permission_denied.store(true, Ordering::SeqCst);
    }

    pub fn lose_stream(&self) {
        self.stream_live.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: CaptureEvent) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            let _ = sink.send(event);
        }
    }

    pub fn emit_silence(&self) {
        self.emit(CaptureEvent::Silence);
    }

    pub fn emit_error(&self, message: &str) {
        self.emit(CaptureEvent::Error(message.to_string()));
    }

    pub fn emit_segment(&self, segment: AudioSegment) {
        self.emit(CaptureEvent::Segment(segment));
    }

    pub fn silence_timeout_ms(&self) -> Option<u64> {
        self.options.lock().unwrap().map(|o| o.silence_timeout_ms)
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSession for FakeCapture {
    async fn request_permission(&self) -> Result<(), TurnError> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.permission_denied.load(Ordering::SeqCst) {
            Err(TurnError::PermissionDenied("user refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn initialize(&self, options: CaptureOptions) -> mpsc::UnboundedReceiver<CaptureEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock().unwrap() = Some(tx);
        *self.options.lock().unwrap() = Some(options);
        rx
    }

    async fn start_recording(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let live = self.stream_live.load(Ordering::SeqCst);
        self.recording.store(live, Ordering::SeqCst);
        live
    }

    async fn stop_recording(&self) -> Option<AudioSegment> {
        self.recording.store(false, Ordering::SeqCst);
        Some(AudioSegment::wav(vec![0u8; 64], 500))
    }

    async fn resume_after_playback(&self) -> Result<(), TurnError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        if self.stream_live.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TurnError::DeviceLost("stream ended".to_string()))
        }
    }

    fn force_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.recording.store(false, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
    }

    fn state(&self) -> CaptureState {
        CaptureState {
            has_stream: self.stream_live.load(Ordering::SeqCst),
            is_recording: self.recording.load(Ordering::SeqCst),
        }
    }
}

// ----- transcription -----

enum Script {
    Text(String),
    Fail(TurnError),
    Held(String, oneshot::Receiver<()>),
}

pub struct FakeTranscriber {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(SessionToken, VoiceMode)>>,
}

impl FakeTranscriber {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with(&self, text: &str) {
        self.script.lock().unwrap().push_back(Script::Text(text.to_string()));
    }

    pub fn fail_next(&self, err: TurnError) {
        self.script.lock().unwrap().push_back(Script::Fail(err));
    }

    /// The next transcription answers `text` only once the returned sender fires.
    pub fn hold_next(&self, text: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script
            .lock()
            .unwrap()
            .push_back(Script::Held(text.to_string(), rx));
        tx
    }

    pub fn tokens(&self) -> Vec<SessionToken> {
        self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn modes(&self) -> Vec<VoiceMode> {
        self.requests.lock().unwrap().iter().map(|(_, m)| *m).collect()
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript, TurnError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.session_token, request.mode));
        let next = self.script.lock().unwrap().pop_front();

        let text = match next {
            Some(Script::Text(text)) => text,
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Held(text, gate)) => {
                let _ = gate.await;
                text
            }
            None => String::new(),
        };

        Ok(Transcript {
            text,
            session_token: request.session_token,
        })
    }
}

// ----- dispatch -----

pub struct FakeDispatcher {
    failure: Mutex<Option<TurnError>>,
    held: Mutex<Option<oneshot::Receiver<()>>>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self {
            failure: Mutex::new(None),
            held: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with(&self, err: TurnError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// The next dispatch resolves only once the returned sender fires.
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.held.lock().unwrap() = Some(rx);
        tx
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TurnError> {
        self.requests.lock().unwrap().push(request);
        let held = self.held.lock().unwrap().take();
        if let Some(release) = held {
            let _ = release.await;
        }
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ----- playback -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spoken {
    pub reply_id: String,
    pub text: String,
    pub session_token: SessionToken,
}

pub struct FakePlayback {
    failure: Mutex<Option<TurnError>>,
    spoken: Mutex<Vec<Spoken>>,
    pending: Mutex<Vec<PlaybackCallback>>,
    stops: AtomicUsize,
    suspends: AtomicUsize,
}

impl FakePlayback {
    pub fn new() -> Self {
        Self {
            failure: Mutex::new(None),
            spoken: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            suspends: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, err: TurnError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    /// Fire the completion callback of the most recent reply.
    pub fn finish_latest(&self, outcome: PlaybackOutcome) {
        if let Some(callback) = self.pending.lock().unwrap().pop() {
            callback.complete(outcome);
        }
    }

    pub fn spoken(&self) -> Vec<Spoken> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Playback for FakePlayback {
    async fn speak(&self, request: SpeakRequest) -> Result<(), TurnError> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        self.spoken.lock().unwrap().push(Spoken {
            reply_id: request.reply_id,
            text: request.text,
            session_token: request.session_token,
        });
        self.pending.lock().unwrap().push(request.on_complete);
        Ok(())
    }

    // Callbacks stay pending so tests can fire them late
    fn stop_all(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    async fn resume(&self) {}
}

// ----- watcher -----

/// Watcher whose channels the test can sever, or which refuses to subscribe.
pub struct ScriptedWatcher {
    refuse: bool,
    senders: Mutex<Vec<mpsc::Sender<ReplyEvent>>>,
}

impl ScriptedWatcher {
    pub fn new() -> Self {
        Self {
            refuse: false,
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            refuse: true,
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnect_all(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl CompletionWatcher for ScriptedWatcher {
    async fn subscribe(&self, _conversation_id: &str) -> Result<ReplySubscription, TurnError> {
        if self.refuse {
            return Err(TurnError::WatcherUnavailable("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(8);
        self.senders.lock().unwrap().push(tx);
        Ok(ReplySubscription::new(rx, SubscriptionHandle::new()))
    }
}
