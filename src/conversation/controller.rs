//! # Turn Controller
//!
//! Drives one spoken dialogue: listen, transcribe, dispatch, wait for the pushed
//! reply, speak it, listen again. The controller is the single logical owner of the
//! session; concurrency only comes from *which* collaborator completion arrives next.
//!
//! ## Session discipline:
//! - Every run of the session gets a fresh [`SessionToken`] and [`CancellationToken`].
//! - Every `.await` on a collaborator is a resumption point. Before touching session
//!   state afterwards the controller re-checks `shutting_down` and the token
//!   first; a mismatch means the continuation is stale
//!   and it is dropped silently.
//! - The session mutex is never held across an `.await`.
//!
//! ## Observability:
//! The presentation layer reads the `turnState` watch channel and an optional stream
//! of [`TurnNotice`]s. It never sees collaborator errors directly.

use crate::arbitrator::{MicrophoneArbitrator, MicrophoneLease, OwnerTag};
use crate::conversation::collaborators::{
    AudioSegment, CaptureEvent, CaptureOptions, CaptureSession, DispatchRequest, Dispatcher,
    Playback, PlaybackCallback, PlaybackOutcome, SpeakRequest, Transcriber, TranscriptionOptions,
    TranscriptionRequest, VoiceMode,
};
use crate::conversation::state::{
    ConnectingCause, ReplyEvent, SessionToken, Turn, TurnNotice, TurnState,
};
use crate::conversation::watcher::{CompletionWatcher, SubscriptionHandle};
use crate::error::TurnError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 64;

/// Per-conversation tuning, snapshotted from the application config when the
/// conversation is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Silence that ends an utterance
    pub silence_timeout_ms: u64,
    /// Bound on `AwaitingReply`; `None` waits indefinitely
    pub reply_timeout_ms: Option<u64>,
    /// Language hint passed to transcription
    pub language: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 2000,
            reply_timeout_ms: None,
            language: None,
        }
    }
}

/// The resources a controller orchestrates.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn CaptureSession>,
    pub transcriber: Arc<dyn Transcriber>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub watcher: Arc<dyn CompletionWatcher>,
    pub playback: Arc<dyn Playback>,
}

#[derive(Debug, Default)]
struct ControllerStats {
    turns_completed: AtomicU64,
    duplicate_replies_ignored: AtomicU64,
    stale_continuations_discarded: AtomicU64,
    transcription_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    playback_failures: AtomicU64,
    empty_transcripts: AtomicU64,
}

/// Point-in-time copy of a controller's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub turns_completed: u64,
    pub duplicate_replies_ignored: u64,
    pub stale_continuations_discarded: u64,
    pub transcription_failures: u64,
    pub dispatch_failures: u64,
    pub playback_failures: u64,
    pub empty_transcripts: u64,
}

impl StatsSnapshot {
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.turns_completed += other.turns_completed;
        self.duplicate_replies_ignored += other.duplicate_replies_ignored;
        self.stale_continuations_discarded += other.stale_continuations_discarded;
        self.transcription_failures += other.transcription_failures;
        self.dispatch_failures += other.dispatch_failures;
        self.playback_failures += other.playback_failures;
        self.empty_transcripts += other.empty_transcripts;
    }
}

impl ControllerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            duplicate_replies_ignored: self.duplicate_replies_ignored.load(Ordering::Relaxed),
            stale_continuations_discarded: self
                .stale_continuations_discarded
                .load(Ordering::Relaxed),
            transcription_failures: self.transcription_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            playback_failures: self.playback_failures.load(Ordering::Relaxed),
            empty_transcripts: self.empty_transcripts.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Mutable per-session fields. Only touched under `Inner::session`.
struct Session {
    state: TurnState,
    token: Option<SessionToken>,
    cancel: CancellationToken,
    lease: Option<MicrophoneLease>,
    subscription: Option<SubscriptionHandle>,
    last_processed_reply_id: Option<String>,
    playing_reply_id: Option<String>,
    turn: Option<Turn>,
    shutting_down: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            state: TurnState::Idle,
            token: None,
            cancel: CancellationToken::new(),
            lease: None,
            subscription: None,
            last_processed_reply_id: None,
            playing_reply_id: None,
            turn: None,
            shutting_down: false,
        }
    }
}

struct Inner {
    conversation_id: String,
    config: ControllerConfig,
    arbitrator: MicrophoneArbitrator,
    collab: Collaborators,
    state_tx: watch::Sender<TurnState>,
    notices: broadcast::Sender<TurnNotice>,
    stats: ControllerStats,
    session: Mutex<Session>,
}

/// Handle to one conversation's turn state machine. Clones share the session.
#[derive(Clone)]
pub struct TurnController {
    inner: Arc<Inner>,
}

impl TurnController {
    pub fn new(
        conversation_id: impl Into<String>,
        config: ControllerConfig,
        arbitrator: MicrophoneArbitrator,
        collab: Collaborators,
    ) -> Self {
        let (state_tx, _) = watch::channel(TurnState::Idle);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                conversation_id: conversation_id.into(),
                config,
                arbitrator,
                collab,
                state_tx,
                notices,
                stats: ControllerStats::default(),
                session: Mutex::new(Session::new()),
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn state(&self) -> TurnState {
        self.session().state
    }

    /// Observable `turnState` stream for the presentation layer.
    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.inner.state_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<TurnNotice> {
        self.inner.notices.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Token of the running session, if one is running.
    pub fn session_token(&self) -> Option<SessionToken> {
        self.session().token
    }

    /// The turn in progress, from transcript until the reply finishes playing.
    pub fn current_turn(&self) -> Option<Turn> {
        self.session().turn.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.session().shutting_down
    }

    /// Whether both handles drive the same session.
    pub fn ptr_eq(&self, other: &TurnController) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Request the microphone and start listening.
    ///
    /// Only acts from `Idle` or `Connecting`; a call made while a previous start is
    /// still establishing (or the session is already running) is a no-op. Setup
    /// failures leave the session in `Connecting` and are returned to the caller.
    pub async fn start(&self) -> Result<(), TurnError> {
        let (token, cancel) = {
            let mut session = self.session();
            if session.shutting_down {
                return Err(TurnError::Closed);
            }
            if !session.state.accepts_start() {
                debug!(
                    conversation_id = %self.inner.conversation_id,
                    state = %session.state,
                    "Start ignored, session already running"
                );
                return Ok(());
            }

            let token = SessionToken::new();
            session.token = Some(token);
            session.cancel = CancellationToken::new();
            self.transition(&mut session, TurnState::Establishing);
            (token, session.cancel.clone())
        };

        info!(
            conversation_id = %self.inner.conversation_id,
            session_token = %token,
            "Starting conversation session"
        );

        let permission = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abandoned_start(),
            result = self.inner.collab.capture.request_permission() => result,
        };

        {
            let Some(mut session) = self.current(token, "permission") else {
                return self.abandoned_start();
            };
            if let Err(err) = permission {
                self.enter_connecting(&mut session, err.clone());
                return Err(err);
            }
            match self.inner.arbitrator.acquire(OwnerTag::Conversation) {
                Ok(lease) => session.lease = Some(lease),
                Err(denied) => {
                    let err = TurnError::MicrophoneBusy {
                        holder: denied.held_by,
                    };
                    self.enter_connecting(&mut session, err.clone());
                    return Err(err);
                }
            }
        }

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abandoned_start(),
            result = self.inner.collab.watcher.subscribe(&self.inner.conversation_id) => result,
        };

        let replies = {
            let Some(mut session) = self.current(token, "subscribe") else {
                if let Ok(subscription) = subscribed {
                    subscription.handle().unsubscribe();
                }
                return self.abandoned_start();
            };
            match subscribed {
                Ok(subscription) => {
                    let (replies, handle) = subscription.into_parts();
                    session.subscription = Some(handle);
                    replies
                }
                Err(err) => {
                    self.enter_connecting(&mut session, err.clone());
                    return Err(err);
                }
            }
        };
        tokio::spawn(self.clone().pump_replies(token, cancel.clone(), replies));

        let events = self.inner.collab.capture.initialize(CaptureOptions {
            silence_timeout_ms: self.inner.config.silence_timeout_ms,
        });
        tokio::spawn(self.clone().pump_capture(token, cancel.clone(), events));

        let recording = self.inner.collab.capture.start_recording().await;

        let Some(mut session) = self.current(token, "start recording") else {
            self.release_orphaned_capture();
            return self.abandoned_start();
        };
        if !recording {
            let err = TurnError::DeviceLost("recording could not be started".to_string());
            self.enter_connecting(&mut session, err.clone());
            return Err(err);
        }
        self.transition(&mut session, TurnState::Listening);
        Ok(())
    }

    /// End the conversation. Safe from any state and idempotent.
    ///
    /// `shutting_down` is set before any cleanup so that every in-flight
    /// continuation observes it and becomes a no-op.
    pub fn close(&self) {
        let (lease, subscription) = {
            let mut session = self.session();
            if session.shutting_down {
                return;
            }
            session.shutting_down = true;
            session.token = None;
            session.last_processed_reply_id = None;
            session.playing_reply_id = None;
            session.turn = None;
            session.cancel.cancel();
            self.transition(&mut session, TurnState::Closed);
            (session.lease.take(), session.subscription.take())
        };

        self.inner.collab.playback.stop_all();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        // Without a lease the capture belongs to whoever holds the microphone
        if let Some(lease) = lease {
            self.inner.collab.capture.force_cleanup();
            self.inner.arbitrator.release_lease(&lease);
        } else {
            self.release_orphaned_capture();
        }

        info!(conversation_id = %self.inner.conversation_id, "Conversation closed");
    }

    // ----- session plumbing -----

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the session if `token` still identifies the running session.
    /// Otherwise the continuation at `site` is stale and is counted and dropped.
    fn current(&self, token: SessionToken, site: &'static str) -> Option<MutexGuard<'_, Session>> {
        let session = self.session();
        if !session.shutting_down && session.token == Some(token) {
            return Some(session);
        }
        drop(session);
        self.note_stale(token, site);
        None
    }

    /// Like [`current`](Self::current), but also requires the session to be in `expected`.
    fn current_in(
        &self,
        token: SessionToken,
        expected: TurnState,
        site: &'static str,
    ) -> Option<MutexGuard<'_, Session>> {
        let session = self.current(token, site)?;
        if session.state != expected {
            debug!(
                conversation_id = %self.inner.conversation_id,
                state = %session.state,
                site,
                "Continuation no longer applies to current state"
            );
            return None;
        }
        Some(session)
    }

    fn note_stale(&self, token: SessionToken, site: &'static str) {
        bump(&self.inner.stats.stale_continuations_discarded);
        debug!(
            conversation_id = %self.inner.conversation_id,
            session_token = %token,
            site,
            "Discarding stale continuation"
        );
    }

    fn abandoned_start(&self) -> Result<(), TurnError> {
        if self.session().shutting_down {
            Err(TurnError::Closed)
        } else {
            Ok(())
        }
    }

    fn transition(&self, session: &mut Session, next: TurnState) {
        let previous = session.state;
        session.state = next;
        self.inner.state_tx.send_replace(next);
        if previous != next {
            info!(
                conversation_id = %self.inner.conversation_id,
                from = %previous,
                to = %next,
                "Turn state changed"
            );
        }
    }

    fn notify(&self, notice: TurnNotice) {
        // No receivers is fine
        let _ = self.inner.notices.send(notice);
    }

    fn enter_connecting(&self, session: &mut Session, err: TurnError) {
        self.fall_back(session, ConnectingCause::from(&err), err);
    }

    /// Drop to `Connecting`, tearing down everything the running session holds.
    fn fall_back(&self, session: &mut Session, cause: ConnectingCause, err: TurnError) {
        warn!(
            conversation_id = %self.inner.conversation_id,
            error = %err,
            "Conversation session interrupted"
        );

        session.token = None;
        session.cancel.cancel();
        session.playing_reply_id = None;
        session.turn = None;
        if let Some(subscription) = session.subscription.take() {
            subscription.unsubscribe();
        }
        self.inner.collab.playback.stop_all();
        // A session that never got the lease leaves the capture to its owner
        if let Some(lease) = session.lease.take() {
            self.inner.collab.capture.force_cleanup();
            self.inner.arbitrator.release_lease(&lease);
        }

        self.transition(session, TurnState::Connecting(cause));
        self.notify(TurnNotice::Error { error: err });
    }

    /// A stale `start_recording` may have re-armed the recorder after the session
    /// stopped. Undo it unless a newer session or another lease holder now owns
    /// the capture.
    fn release_orphaned_capture(&self) {
        let orphaned = {
            let session = self.session();
            session.token.is_none() && session.lease.is_none()
        };
        if orphaned && self.inner.arbitrator.holder().is_none() {
            self.inner.collab.capture.force_cleanup();
        }
    }

    /// Restart recording and return to `Listening`, ending the current turn.
    /// `completed` counts it as a finished turn.
    async fn listen_again(&self, token: SessionToken, completed: bool) {
        let recording = self.inner.collab.capture.start_recording().await;

        let Some(mut session) = self.current(token, "resume recording") else {
            self.release_orphaned_capture();
            return;
        };
        if !recording {
            self.enter_connecting(
                &mut session,
                TurnError::DeviceLost("recording could not be restarted".to_string()),
            );
            return;
        }
        session.turn = None;
        if completed {
            bump(&self.inner.stats.turns_completed);
        }
        self.transition(&mut session, TurnState::Listening);
    }

    // ----- capture -----

    async fn pump_capture(
        self,
        token: SessionToken,
        cancel: CancellationToken,
        mut events: mpsc::UnboundedReceiver<CaptureEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(CaptureEvent::Silence) => self.on_silence(token, &cancel).await,
                    Some(CaptureEvent::Segment(segment)) => self.on_segment(token, &cancel, segment),
                    Some(CaptureEvent::Error(message)) => self.on_capture_error(token, message),
                    None => break,
                },
            }
        }
        debug!(conversation_id = %self.inner.conversation_id, "Capture pump stopped");
    }

    async fn on_silence(&self, token: SessionToken, cancel: &CancellationToken) {
        {
            let Some(mut session) = self.current_in(token, TurnState::Listening, "silence") else {
                return;
            };
            self.transition(&mut session, TurnState::Processing);
        }

        let segment = self.inner.collab.capture.stop_recording().await;

        match segment {
            Some(segment) if !segment.is_empty() => self.begin_transcription(token, cancel, segment),
            _ => {
                let alive = self.current_in(token, TurnState::Processing, "stop recording").is_some();
                if alive {
                    debug!(conversation_id = %self.inner.conversation_id, "Silence without audio");
                    self.listen_again(token, false).await;
                }
            }
        }
    }

    /// The recorder finished on its own (maximum utterance length).
    fn on_segment(&self, token: SessionToken, cancel: &CancellationToken, segment: AudioSegment) {
        {
            let Some(mut session) = self.current_in(token, TurnState::Listening, "segment") else {
                return;
            };
            self.transition(&mut session, TurnState::Processing);
        }
        self.begin_transcription(token, cancel, segment);
    }

    fn on_capture_error(&self, token: SessionToken, message: String) {
        let Some(mut session) = self.current(token, "capture error") else {
            return;
        };
        self.enter_connecting(&mut session, TurnError::DeviceLost(message));
    }

    // ----- transcription & dispatch -----

    fn begin_transcription(&self, token: SessionToken, cancel: &CancellationToken, segment: AudioSegment) {
        debug!(
            conversation_id = %self.inner.conversation_id,
            duration_ms = segment.duration_ms,
            bytes = segment.bytes.len(),
            "Utterance captured"
        );
        tokio::spawn(self.clone().transcribe_and_dispatch(token, cancel.clone(), segment));
    }

    async fn transcribe_and_dispatch(
        self,
        token: SessionToken,
        cancel: CancellationToken,
        segment: AudioSegment,
    ) {
        let request = TranscriptionRequest {
            audio: segment,
            conversation_id: self.inner.conversation_id.clone(),
            options: TranscriptionOptions {
                language: self.inner.config.language.clone(),
            },
            mode: VoiceMode::Conversation,
            session_token: token,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.note_stale(token, "transcription"),
            result = self.inner.collab.transcriber.transcribe(request) => result,
        };

        let transcript = match outcome {
            Ok(transcript) => transcript,
            Err(err) => {
                let alive = self.current_in(token, TurnState::Processing, "transcription").is_some();
                if alive {
                    bump(&self.inner.stats.transcription_failures);
                    warn!(conversation_id = %self.inner.conversation_id, error = %err, "Transcription failed");
                    self.notify(TurnNotice::Error { error: err });
                    self.listen_again(token, false).await;
                }
                return;
            }
        };

        if transcript.session_token != token {
            return self.note_stale(transcript.session_token, "transcript token");
        }

        if transcript.is_blank() {
            let alive = self.current_in(token, TurnState::Processing, "transcription").is_some();
            if alive {
                bump(&self.inner.stats.empty_transcripts);
                debug!(conversation_id = %self.inner.conversation_id, "Empty transcript, listening again");
                self.listen_again(token, false).await;
            }
            return;
        }

        let text = transcript.text.trim().to_string();
        let correlation_id = {
            let Some(mut session) = self.current_in(token, TurnState::Processing, "transcription")
            else {
                return;
            };
            let turn = Turn::new(text.clone());
            let correlation_id = turn.correlation_id;
            session.turn = Some(turn);
            // Enter AwaitingReply before dispatching; the reply may be pushed
            // before the dispatch call itself returns.
            self.transition(&mut session, TurnState::AwaitingReply);
            correlation_id
        };

        self.notify(TurnNotice::UserTurn {
            correlation_id,
            text: text.clone(),
        });
        self.arm_reply_timer(token, &cancel, correlation_id);

        let request = DispatchRequest {
            conversation_id: self.inner.conversation_id.clone(),
            text,
            correlation_id,
            mode: VoiceMode::Conversation,
            session_token: token,
        };

        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.note_stale(token, "dispatch"),
            result = self.inner.collab.dispatcher.dispatch(request) => result,
        };

        let Err(err) = dispatched else {
            debug!(conversation_id = %self.inner.conversation_id, %correlation_id, "Message dispatched");
            return;
        };

        let still_waiting = {
            match self.current_in(token, TurnState::AwaitingReply, "dispatch") {
                Some(mut session)
                    if session.turn.as_ref().map(|t| t.correlation_id) == Some(correlation_id) =>
                {
                    session.turn = None;
                    true
                }
                _ => false,
            }
        };
        if still_waiting {
            bump(&self.inner.stats.dispatch_failures);
            warn!(conversation_id = %self.inner.conversation_id, error = %err, "Dispatch failed");
            self.notify(TurnNotice::Error { error: err });
            self.listen_again(token, false).await;
        }
    }

    fn arm_reply_timer(&self, token: SessionToken, cancel: &CancellationToken, correlation_id: Uuid) {
        let Some(timeout_ms) = self.inner.config.reply_timeout_ms else {
            return;
        };
        let this = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    this.on_reply_timeout(token, correlation_id, timeout_ms);
                }
            }
        });
    }

    fn on_reply_timeout(&self, token: SessionToken, correlation_id: Uuid, after_ms: u64) {
        let Some(mut session) = self.current_in(token, TurnState::AwaitingReply, "reply timer") else {
            return;
        };
        if session.turn.as_ref().map(|t| t.correlation_id) != Some(correlation_id) {
            return;
        }
        self.enter_connecting(&mut session, TurnError::ReplyTimedOut { after_ms });
    }

    // ----- replies & playback -----

    async fn pump_replies(
        self,
        token: SessionToken,
        cancel: CancellationToken,
        mut replies: mpsc::Receiver<ReplyEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = replies.recv() => match event {
                    Some(event) => self.on_reply(token, &cancel, event).await,
                    None => {
                        self.on_watcher_closed(token);
                        break;
                    }
                },
            }
        }
        debug!(conversation_id = %self.inner.conversation_id, "Reply pump stopped");
    }

    fn on_watcher_closed(&self, token: SessionToken) {
        let Some(mut session) = self.current(token, "watcher closed") else {
            return;
        };
        // No automatic resubscription here, the user retries with start()
        self.fall_back(
            &mut session,
            ConnectingCause::WatcherDisconnected,
            TurnError::WatcherUnavailable("reply channel closed".to_string()),
        );
    }

    async fn on_reply(&self, token: SessionToken, cancel: &CancellationToken, event: ReplyEvent) {
        {
            let Some(mut session) = self.current(token, "reply") else {
                return;
            };
            if session.last_processed_reply_id.as_deref() == Some(event.reply_id.as_str()) {
                bump(&self.inner.stats.duplicate_replies_ignored);
                debug!(
                    conversation_id = %self.inner.conversation_id,
                    reply_id = %event.reply_id,
                    "Duplicate reply ignored"
                );
                return;
            }
            if session.state != TurnState::AwaitingReply {
                debug!(
                    conversation_id = %self.inner.conversation_id,
                    reply_id = %event.reply_id,
                    state = %session.state,
                    "Reply ignored, not awaiting one"
                );
                return;
            }

            session.last_processed_reply_id = Some(event.reply_id.clone());
            session.playing_reply_id = Some(event.reply_id.clone());
            if let Some(turn) = session.turn.as_mut() {
                turn.assistant_reply_id = Some(event.reply_id.clone());
                turn.assistant_text = Some(event.text.clone());
            }
            self.transition(&mut session, TurnState::Replying);
        }

        self.notify(TurnNotice::ReplyStarted {
            reply_id: event.reply_id.clone(),
            text: event.text.clone(),
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.note_stale(token, "resume audio"),
            _ = self.inner.collab.playback.resume() => {}
        }

        let (on_complete, completion) = PlaybackCallback::channel();
        let request = SpeakRequest {
            conversation_id: self.inner.conversation_id.clone(),
            reply_id: event.reply_id.clone(),
            text: event.text,
            session_token: token,
            on_complete,
        };

        let spoken = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.note_stale(token, "speak"),
            result = self.inner.collab.playback.speak(request) => result,
        };

        if let Err(err) = spoken {
            let failed = {
                match self.current_in(token, TurnState::Replying, "speak") {
                    Some(mut session)
                        if session.playing_reply_id.as_deref() == Some(event.reply_id.as_str()) =>
                    {
                        session.playing_reply_id = None;
                        true
                    }
                    _ => false,
                }
            };
            if failed {
                bump(&self.inner.stats.playback_failures);
                warn!(conversation_id = %self.inner.conversation_id, error = %err, "Playback failed");
                self.notify(TurnNotice::Error { error: err });
                self.listen_again(token, false).await;
            }
            return;
        }

        let this = self.clone();
        let cancel = cancel.clone();
        let reply_id = event.reply_id;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return this.note_stale(token, "playback completion"),
                outcome = completion.wait() => outcome,
            };
            this.on_playback_complete(token, reply_id, outcome).await;
        });
    }

    async fn on_playback_complete(&self, token: SessionToken, reply_id: String, outcome: PlaybackOutcome) {
        {
            let Some(mut session) = self.current_in(token, TurnState::Replying, "playback completion")
            else {
                return;
            };
            if session.playing_reply_id.as_deref() != Some(reply_id.as_str()) {
                drop(session);
                return self.note_stale(token, "superseded playback");
            }
            session.playing_reply_id = None;
        }

        debug!(
            conversation_id = %self.inner.conversation_id,
            %reply_id,
            ?outcome,
            "Reply playback finished"
        );

        self.inner.collab.playback.suspend();
        let resumed = self.inner.collab.capture.resume_after_playback().await;

        {
            let Some(mut session) = self.current(token, "resume capture") else {
                return;
            };
            let lease_held = session
                .lease
                .as_ref()
                .map(|lease| self.inner.arbitrator.is_held(lease))
                .unwrap_or(false);
            let stream_live = self.inner.collab.capture.state().has_stream;

            let failure = match resumed {
                Err(err) => Some(err),
                Ok(()) if !lease_held => {
                    Some(TurnError::DeviceLost("microphone lease is no longer held".to_string()))
                }
                Ok(()) if !stream_live => {
                    Some(TurnError::DeviceLost("capture stream is gone".to_string()))
                }
                Ok(()) => None,
            };
            if let Some(err) = failure {
                self.enter_connecting(&mut session, err);
                return;
            }
        }

        self.listen_again(token, true).await;
    }
}
