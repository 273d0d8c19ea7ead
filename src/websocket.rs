//! # Voice WebSocket
//!
//! One connection per browser tab at `/ws/voice`. The browser owns the physical
//! microphone and speaker; this actor owns everything else for that tab: the
//! stream-fed capture session, the socket playback and at most one open
//! conversation (plus an occasional dictation).
//!
//! ## Protocol:
//! - **Client → Server (JSON)**: `microphone_ready`, `microphone_denied`,
//!   `microphone_lost`, `start_conversation`, `close_conversation`,
//!   `start_dictation`, `playback_complete`, `ping`
//! - **Client → Server (binary)**: 16-bit little-endian mono PCM frames
//! - **Server → Client (JSON)**: `turn_state`, `notice`, `play_reply`,
//!   `stop_audio`, `dictation_result`, `error`, `pong`
//!
//! Closing the socket closes its conversation and releases the microphone.

use crate::audio::capture::StreamCapture;
use crate::audio::processor::AudioFormat;
use crate::conversation::controller::{Collaborators, TurnController};
use crate::conversation::state::{ConnectingCause, TurnNotice, TurnState};
use crate::dictation::DictationSession;
use crate::error::TurnError;
use crate::services::playback::{PlaybackCommand, SocketPlayback};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the client sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Microphone access granted; PCM frames in `audio` format follow
    MicrophoneReady { audio: AudioFormat },

    MicrophoneDenied {
        #[serde(default)]
        reason: Option<String>,
    },

    /// The microphone stream ended on the client
    MicrophoneLost,

    StartConversation { conversation_id: String },

    CloseConversation,

    /// Record one utterance into a text field
    StartDictation {
        #[serde(default)]
        context_id: Option<String>,
    },

    /// The client finished playing a reply
    PlaybackComplete { reply_id: String },

    Ping { timestamp: u64 },
}

/// Messages the server sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TurnState {
        conversation_id: String,
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<ConnectingCause>,
        /// listening / thinking / speaking / connecting / idle
        indicator: &'static str,
    },

    Notice {
        conversation_id: String,
        detail: TurnNotice,
    },

    PlayReply {
        reply_id: String,
        text: String,
        audio_url: String,
    },

    StopAudio,

    DictationResult { text: String },

    Error {
        code: String,
        message: String,
        recoverable: bool,
    },

    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn turn_state(conversation_id: &str, state: TurnState) -> Self {
        let cause = match state {
            TurnState::Connecting(cause) => Some(cause),
            _ => None,
        };
        ServerMessage::TurnState {
            conversation_id: conversation_id.to_string(),
            state: state.as_str(),
            cause,
            indicator: state.indicator(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>, recoverable: bool) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            recoverable,
        }
    }

    fn from_turn_error(err: &TurnError) -> Self {
        Self::error(err.kind(), err.to_string(), err.is_recoverable())
    }
}

impl From<PlaybackCommand> for ServerMessage {
    fn from(command: PlaybackCommand) -> Self {
        match command {
            PlaybackCommand::Play {
                reply_id,
                text,
                audio_url,
            } => ServerMessage::PlayReply {
                reply_id,
                text,
                audio_url,
            },
            PlaybackCommand::Stop => ServerMessage::StopAudio,
        }
    }
}

// ----- actor messages -----

#[derive(Message)]
#[rtype(result = "()")]
struct StateChanged {
    conversation_id: String,
    state: TurnState,
}

#[derive(Message)]
#[rtype(result = "()")]
struct NoticeReceived {
    conversation_id: String,
    notice: TurnNotice,
}

#[derive(Message)]
#[rtype(result = "()")]
struct ForwardPlayback(PlaybackCommand);

#[derive(Message)]
#[rtype(result = "()")]
struct DictationFinished(Result<String, TurnError>);

#[derive(Message)]
#[rtype(result = "()")]
struct StartFailed {
    conversation_id: String,
    error: TurnError,
}

/// Actor for one voice connection.
pub struct VoiceSocket {
    app_state: AppState,
    capture: StreamCapture,
    playback_tx: mpsc::UnboundedSender<PlaybackCommand>,
    playback_rx: Option<mpsc::UnboundedReceiver<PlaybackCommand>>,
    playback: Option<Arc<SocketPlayback>>,
    controller: Option<TurnController>,
    dictation: Option<CancellationToken>,
    last_heartbeat: Instant,
}

impl VoiceSocket {
    pub fn new(app_state: AppState) -> Self {
        let capture = StreamCapture::new(app_state.get_config().capture_config());
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        Self {
            app_state,
            capture,
            playback_tx,
            playback_rx: Some(playback_rx),
            playback: None,
            controller: None,
            dictation: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "Failed to serialize voice socket message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "Voice socket error");
        self.send(ctx, &ServerMessage::error(code, message, true));
    }

    fn is_current(&self, conversation_id: &str) -> bool {
        self.controller
            .as_ref()
            .map_or(false, |c| c.conversation_id() == conversation_id)
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::MicrophoneReady { audio } => {
                if let Err(err) = self.capture.microphone_ready(audio) {
                    self.send_error(ctx, "unsupported_audio_format", &err);
                }
            }
            ClientMessage::MicrophoneDenied { reason } => {
                self.capture
                    .microphone_denied(reason.unwrap_or_else(|| "denied by user".to_string()));
            }
            ClientMessage::MicrophoneLost => self.capture.microphone_lost(),
            ClientMessage::StartConversation { conversation_id } => {
                self.start_conversation(conversation_id, ctx);
            }
            ClientMessage::CloseConversation => self.close_conversation(),
            ClientMessage::StartDictation { context_id } => self.start_dictation(context_id, ctx),
            ClientMessage::PlaybackComplete { reply_id } => {
                let accepted = self
                    .playback
                    .as_ref()
                    .map_or(false, |playback| playback.complete(&reply_id));
                if !accepted {
                    debug!(%reply_id, "Ignoring completion for a reply that is not playing");
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &ServerMessage::Pong { timestamp });
            }
        }
    }

    fn start_conversation(&mut self, conversation_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        if conversation_id.trim().is_empty() {
            self.send_error(ctx, "invalid_conversation", "conversation_id must not be empty");
            return;
        }

        // Same conversation: retry from Connecting (a no-op while it runs)
        if let Some(controller) = self.controller.as_ref().filter(|c| !c.is_closed()) {
            if controller.conversation_id() == conversation_id {
                self.spawn_start(controller.clone(), ctx);
                return;
            }
        }
        self.close_conversation();

        let config = self.app_state.get_config();
        let services = self.app_state.services();
        let playback = Arc::new(SocketPlayback::new(
            services.synthesizer.clone(),
            self.playback_tx.clone(),
        ));

        let controller = TurnController::new(
            conversation_id.clone(),
            config.controller_config(),
            self.app_state.arbitrator.clone(),
            Collaborators {
                capture: Arc::new(self.capture.clone()),
                transcriber: services.transcriber.clone(),
                dispatcher: services.dispatcher.clone(),
                watcher: services.watcher.clone(),
                playback: playback.clone(),
            },
        );

        if let Err(err) = self.app_state.conversations.register(controller.clone()) {
            self.send_error(ctx, "conversation_rejected", &err.to_string());
            return;
        }

        let id = conversation_id.clone();
        ctx.add_message_stream(WatchStream::new(controller.subscribe_state()).map(move |state| {
            StateChanged {
                conversation_id: id.clone(),
                state,
            }
        }));

        let id = conversation_id.clone();
        ctx.add_message_stream(
            BroadcastStream::new(controller.notices()).filter_map(move |notice| {
                let id = id.clone();
                async move {
                    notice.ok().map(|notice| NoticeReceived {
                        conversation_id: id,
                        notice,
                    })
                }
            }),
        );

        info!(%conversation_id, "Conversation opened on voice socket");
        self.playback = Some(playback);
        self.controller = Some(controller.clone());
        self.spawn_start(controller, ctx);
    }

    fn spawn_start(&self, controller: TurnController, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        tokio::spawn(async move {
            if let Err(error) = controller.start().await {
                addr.do_send(StartFailed {
                    conversation_id: controller.conversation_id().to_string(),
                    error,
                });
            }
        });
    }

    fn close_conversation(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.close();
            self.app_state.conversations.remove(&controller);
            info!(conversation_id = %controller.conversation_id(), "Conversation closed by client");
        }
        self.playback = None;
    }

    fn start_dictation(&mut self, context_id: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.dictation.is_some() {
            self.send_error(ctx, "dictation_busy", "A dictation is already in progress");
            return;
        }

        let config = self.app_state.get_config();
        let context_id = context_id
            .or_else(|| self.controller.as_ref().map(|c| c.conversation_id().to_string()))
            .unwrap_or_else(|| "dictation".to_string());
        let dictation = DictationSession::new(
            context_id,
            self.app_state.arbitrator.clone(),
            Arc::new(self.capture.clone()),
            self.app_state.services().transcriber.clone(),
            config.conversation.silence_timeout_ms,
            config.services.language.clone(),
        );

        let cancel = CancellationToken::new();
        self.dictation = Some(cancel.clone());
        let addr = ctx.address();
        tokio::spawn(async move {
            let result = dictation.run(&cancel).await;
            addr.do_send(DictationFinished(result));
        });
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Voice socket connected");
        self.app_state.increment_active_connections();

        if let Some(rx) = self.playback_rx.take() {
            ctx.add_message_stream(UnboundedReceiverStream::new(rx).map(ForwardPlayback));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Voice socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(cancel) = self.dictation.take() {
            cancel.cancel();
        }
        self.close_conversation();
        self.capture.microphone_lost();
        self.app_state.decrement_active_connections();
        info!("Voice socket disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid message: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                if let Err(err) = self.capture.push_frame(&data) {
                    self.send_error(ctx, "audio_error", &err);
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Voice socket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Voice socket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<StateChanged> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: StateChanged, ctx: &mut Self::Context) {
        // A replaced conversation may still report its final Closed state
        if !self.is_current(&msg.conversation_id) && !msg.state.is_closed() {
            return;
        }
        self.send(ctx, &ServerMessage::turn_state(&msg.conversation_id, msg.state));
    }
}

impl Handler<NoticeReceived> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: NoticeReceived, ctx: &mut Self::Context) {
        if !self.is_current(&msg.conversation_id) {
            return;
        }
        self.send(
            ctx,
            &ServerMessage::Notice {
                conversation_id: msg.conversation_id,
                detail: msg.notice,
            },
        );
    }
}

impl Handler<ForwardPlayback> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: ForwardPlayback, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::from(msg.0));
    }
}

impl Handler<DictationFinished> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: DictationFinished, ctx: &mut Self::Context) {
        self.dictation = None;
        match msg.0 {
            Ok(text) => self.send(ctx, &ServerMessage::DictationResult { text }),
            Err(TurnError::Closed) => {}
            Err(err) => self.send(ctx, &ServerMessage::from_turn_error(&err)),
        }
    }
}

impl Handler<StartFailed> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: StartFailed, _ctx: &mut Self::Context) {
        // Setup failures already reached the client as a Connecting state and a notice
        debug!(
            conversation_id = %msg.conversation_id,
            error = %msg.error,
            "Conversation start failed"
        );
    }
}

/// `GET /ws/voice`: upgrade to a voice socket.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New voice socket request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(VoiceSocket::new(app_state.get_ref().clone()), &req, stream)
}
