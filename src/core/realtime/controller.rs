//! Model session controller: the orchestration state machine.
//!
//! ```text
//! Idle -> Connecting -> AwaitingSessionAck -> Active -> Closed
//!                                               \-> Failed -> (connect) -> Connecting
//! ```
//!
//! On connect the controller sends `session.update`, then runs a pump task
//! that forwards conversation audio as `input_audio_buffer.append` events.
//! Inbound events drive the output buffer and the turn-state signal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use super::base::{ControllerState, TurnState};
use super::config::{ModelSessionConfig, RealtimeSettings};
use super::connection::{EventSender, ProtocolConnection, ServerEventHandler};
use super::messages::{ClientEvent, ConversationItem, ServerEvent};
use crate::config::{BargeInPolicy, BridgeConfig};
use crate::core::audio::{AudioFormat, AudioOutputBuffer, PacedAudioSource};
use crate::core::conversation::ConversationSession;
use crate::core::events::{
    BridgeEvent, BridgeEventKind, EventRegistry, SubscriptionId, Transcript, TranscriptRole,
};
use crate::errors::{BridgeError, BridgeResult};

/// How long `close` waits for the pump task.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct ControllerInner {
    settings: RealtimeSettings,
    session_config: ModelSessionConfig,
    barge_in: BargeInPolicy,
    conversation: Arc<ConversationSession>,
    output: Arc<AudioOutputBuffer>,
    events: Arc<EventRegistry>,
    state: Mutex<ControllerState>,
    turn: Mutex<TurnState>,
    session_id: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    sender: Mutex<Option<EventSender>>,
    pump_cancel: Mutex<Option<CancellationToken>>,
    span: Span,
}

impl ControllerInner {
    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    /// Unconditional transition. Publishes only on change.
    fn set_state(&self, to: ControllerState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            info!(parent: &self.span, %from, %to, "controller state changed");
            self.events.publish(&BridgeEvent::StateChanged { from, to });
        }
    }

    /// Transition only if currently in `expected`.
    fn transition(&self, expected: ControllerState, to: ControllerState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != expected {
                return false;
            }
            *state = to;
        }
        info!(parent: &self.span, from = %expected, %to, "controller state changed");
        self.events.publish(&BridgeEvent::StateChanged { from: expected, to });
        true
    }

    fn set_turn(&self, to: TurnState) {
        let from = std::mem::replace(&mut *self.turn.lock(), to);
        if from != to {
            debug!(parent: &self.span, %from, %to, "turn changed");
            self.events.publish(&BridgeEvent::TurnChanged { from, to });
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    fn stop_pump(&self) {
        if let Some(token) = self.pump_cancel.lock().take() {
            token.cancel();
        }
    }

    fn handle_speech_started(&self) {
        let flushed = self.output.flush();
        let was_speaking = *self.turn.lock() == TurnState::Speaking;
        debug!(parent: &self.span, flushed, "speech started, output flushed");

        if self.barge_in.cancel_response && was_speaking {
            let sender = self.sender.lock().clone();
            if let Some(sender) = sender {
                if let Err(e) = sender.try_send(&ClientEvent::ResponseCancel) {
                    warn!(parent: &self.span, error = %e, "failed to cancel response on barge-in");
                }
            }
        }
        self.set_turn(TurnState::Listening);
    }
}

impl ServerEventHandler for ControllerInner {
    fn on_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session } => {
                info!(parent: &self.span, session_id = %session.id, "realtime session created");
                *self.session_id.lock() = Some(session.id.clone());
                self.events.publish(&BridgeEvent::SessionCreated {
                    session_id: session.id,
                });
            }
            ServerEvent::SessionUpdated { .. } => {
                debug!(parent: &self.span, "session configuration acknowledged");
            }
            ServerEvent::Error { error } => {
                warn!(parent: &self.span, error = %error, "realtime API error");
                self.record_error(error.to_string());
                self.events.publish(&BridgeEvent::ApiError(error));
            }
            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                trace!(parent: &self.span, audio_start_ms, "speech started");
                self.handle_speech_started();
            }
            ServerEvent::SpeechStopped { audio_end_ms, .. } => {
                trace!(parent: &self.span, audio_end_ms, "speech stopped");
                self.set_turn(TurnState::Thinking);
            }
            ServerEvent::AudioDelta { delta, .. } => match self.output.enqueue_base64(&delta) {
                Ok(len) => {
                    trace!(parent: &self.span, bytes = len, "audio delta queued");
                    self.set_turn(TurnState::Speaking);
                }
                Err(e) => {
                    warn!(parent: &self.span, error = %e, "dropping audio delta");
                    self.record_error(e.to_string());
                    self.events.publish(&BridgeEvent::DecodeError {
                        event_type: "response.audio.delta".to_string(),
                        message: e.to_string(),
                    });
                }
            },
            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                self.events.publish(&BridgeEvent::Transcript(Transcript {
                    role: TranscriptRole::Assistant,
                    text: delta,
                    is_final: false,
                    item_id,
                }));
            }
            ServerEvent::AudioTranscriptDone {
                item_id,
                transcript,
            } => {
                debug!(parent: &self.span, %transcript, "assistant transcript");
                self.events.publish(&BridgeEvent::Transcript(Transcript {
                    role: TranscriptRole::Assistant,
                    text: transcript,
                    is_final: true,
                    item_id,
                }));
            }
            ServerEvent::InputTranscriptionCompleted {
                item_id,
                transcript,
            } => {
                debug!(parent: &self.span, %transcript, "user transcript");
                self.events.publish(&BridgeEvent::Transcript(Transcript {
                    role: TranscriptRole::User,
                    text: transcript,
                    is_final: true,
                    item_id,
                }));
            }
            ServerEvent::TextDelta { delta, .. } => {
                self.events.publish(&BridgeEvent::Text {
                    text: delta,
                    is_final: false,
                });
            }
            ServerEvent::TextDone { text, .. } => {
                self.events.publish(&BridgeEvent::Text {
                    text,
                    is_final: true,
                });
            }
            ServerEvent::ResponseDone { response } => {
                debug!(parent: &self.span, response_id = %response.id, status = %response.status, "response done");
                let turn = *self.turn.lock();
                if matches!(turn, TurnState::Speaking | TurnState::Thinking) {
                    self.set_turn(TurnState::Idle);
                }
                self.events.publish(&BridgeEvent::ResponseDone {
                    response_id: response.id,
                    status: response.status,
                });
            }
            ServerEvent::Unknown { event_type } => {
                trace!(parent: &self.span, %event_type, "ignoring unrecognised event");
            }
            other => {
                trace!(parent: &self.span, event_type = other.event_type(), "event received");
            }
        }
    }

    fn on_invalid_event(&self, event_type: String, error: BridgeError) {
        warn!(parent: &self.span, %event_type, error = %error, "skipping undecodable event");
        self.record_error(error.to_string());
        self.events.publish(&BridgeEvent::DecodeError {
            event_type,
            message: error.to_string(),
        });
    }

    fn on_fatal(&self, error: BridgeError) {
        error!(parent: &self.span, error = %error, "realtime session failed");
        self.stop_pump();
        self.sender.lock().take();
        self.record_error(error.to_string());
        let dropped = self.output.flush();
        debug!(parent: &self.span, dropped, "discarded playback of failed connection");
        self.set_turn(TurnState::Idle);

        let failed = {
            let mut state = self.state.lock();
            match *state {
                ControllerState::Closed | ControllerState::Failed => None,
                from => {
                    *state = ControllerState::Failed;
                    Some(from)
                }
            }
        };
        if let Some(from) = failed {
            self.events.publish(&BridgeEvent::StateChanged {
                from,
                to: ControllerState::Failed,
            });
            self.events.publish(&BridgeEvent::Failed {
                reason: error.to_string(),
            });
        }
    }
}

/// Bridges a conversation's audio to a realtime model and back.
pub struct ModelSessionController {
    inner: Arc<ControllerInner>,
    connection: tokio::sync::Mutex<Option<Arc<ProtocolConnection>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ModelSessionController {
    /// Controller with a fresh conversation session resampling into the
    /// configured input format.
    pub fn new(config: BridgeConfig) -> Self {
        let target = AudioFormat::mono(config.session.input_audio_format.sample_rate());
        let conversation = ConversationSession::new(Uuid::new_v4().to_string(), target);
        Self::with_conversation(config, Arc::new(conversation))
    }

    pub fn with_conversation(config: BridgeConfig, conversation: Arc<ConversationSession>) -> Self {
        let span = info_span!(
            "realtime",
            model = %config.realtime.model,
            conversation = %conversation.id()
        );
        Self {
            inner: Arc::new(ControllerInner {
                output: Arc::new(AudioOutputBuffer::new(config.playback)),
                settings: config.realtime,
                session_config: config.session,
                barge_in: config.barge_in,
                conversation,
                events: Arc::new(EventRegistry::new()),
                state: Mutex::new(ControllerState::Idle),
                turn: Mutex::new(TurnState::Idle),
                session_id: Mutex::new(None),
                last_error: Mutex::new(None),
                sender: Mutex::new(None),
                pump_cancel: Mutex::new(None),
                span,
            }),
            connection: tokio::sync::Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Connect, configure the session and start streaming.
    ///
    /// Allowed from `Idle` and `Failed`. A handshake failure returns the
    /// controller to the state it started in.
    pub async fn connect(&self) -> BridgeResult<()> {
        let inner = &self.inner;
        let start = {
            let mut state = inner.state.lock();
            if !state.can_connect() {
                return Err(BridgeError::Connection(format!(
                    "connect called while {}",
                    *state
                )));
            }
            std::mem::replace(&mut *state, ControllerState::Connecting)
        };
        inner.events.publish(&BridgeEvent::StateChanged {
            from: start,
            to: ControllerState::Connecting,
        });

        // Reap whatever the previous connection left behind.
        self.shutdown_connection().await;
        if start == ControllerState::Failed {
            inner.conversation.clear();
        }

        let connection = Arc::new(ProtocolConnection::new(
            inner.settings.clone(),
            inner.span.clone(),
        ));
        *self.connection.lock().await = Some(connection.clone());

        let handler: Arc<dyn ServerEventHandler> = inner.clone();
        if let Err(e) = connection.connect(handler).await {
            inner.record_error(e.to_string());
            inner.transition(ControllerState::Connecting, start);
            return Err(e);
        }

        if !inner.transition(ControllerState::Connecting, ControllerState::AwaitingSessionAck) {
            connection.close().await;
            return Err(BridgeError::Connection(
                "controller closed during connect".to_string(),
            ));
        }

        let update = ClientEvent::SessionUpdate {
            session: inner.session_config.clone(),
        };
        let sent = match connection.sender() {
            Ok(sender) => configure_session(&sender, &update, start == ControllerState::Failed)
                .await
                .map(|()| sender),
            Err(e) => Err(e),
        };
        let sender = match sent {
            Ok(sender) => sender,
            Err(e) => {
                inner.record_error(e.to_string());
                connection.close().await;
                inner.set_state(ControllerState::Failed);
                return Err(e);
            }
        };
        debug!(parent: &inner.span, "session.update sent");
        *inner.sender.lock() = Some(sender.clone());

        let cancel = CancellationToken::new();
        *inner.pump_cancel.lock() = Some(cancel.clone());
        let pump = tokio::spawn(
            pump_audio(inner.conversation.clone(), sender, cancel)
                .instrument(inner.span.clone()),
        );
        *self.pump.lock() = Some(pump);

        if !inner.transition(ControllerState::AwaitingSessionAck, ControllerState::Active) {
            // Failed or closed while configuring.
            inner.stop_pump();
            return Err(BridgeError::Socket(
                inner
                    .last_error()
                    .unwrap_or_else(|| "connection lost during setup".to_string()),
            ));
        }
        info!(parent: &inner.span, "realtime session active");
        Ok(())
    }

    /// Stop streaming, stop the conversation and close the connection. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state() == ControllerState::Closed {
            return;
        }
        inner.set_state(ControllerState::Closed);
        inner.stop_pump();
        inner.sender.lock().take();
        inner.conversation.stop();
        inner.output.close();
        self.shutdown_connection().await;
        inner.set_turn(TurnState::Idle);
    }

    async fn shutdown_connection(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(PUMP_JOIN_TIMEOUT, &mut pump).await.is_err() {
                warn!(parent: &self.inner.span, "pump task did not stop in time, aborting");
                pump.abort();
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        self.inner.state()
    }

    pub fn turn_state(&self) -> TurnState {
        *self.inner.turn.lock()
    }

    /// Most recent error: API error, decode failure or transport failure.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error()
    }

    /// Server-assigned id from `session.created`.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().clone()
    }

    pub fn conversation(&self) -> &Arc<ConversationSession> {
        &self.inner.conversation
    }

    pub fn output(&self) -> &Arc<AudioOutputBuffer> {
        &self.inner.output
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, kind: BridgeEventKind, subscriber: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, subscriber)
    }

    /// Paced source over the model's audio. Use one source per playback sink.
    pub fn playback_source(&self) -> PacedAudioSource {
        PacedAudioSource::new(self.inner.output.clone())
    }

    /// Whether the pump task is still running.
    pub fn is_pumping(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn active_sender(&self) -> BridgeResult<EventSender> {
        if self.inner.state() != ControllerState::Active {
            return Err(BridgeError::NotConnected);
        }
        self.inner
            .sender
            .lock()
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    /// Add a user text message and request a response.
    pub async fn send_text(&self, text: &str) -> BridgeResult<()> {
        let sender = self.active_sender()?;
        sender
            .send(&ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(text),
            })
            .await?;
        sender.send(&ClientEvent::ResponseCreate).await
    }

    /// Commit buffered input audio (for use without server turn detection).
    pub async fn commit_audio(&self) -> BridgeResult<()> {
        self.active_sender()?
            .send(&ClientEvent::InputAudioBufferCommit)
            .await
    }

    /// Ask the model to stop the in-progress response.
    pub async fn cancel_response(&self) -> BridgeResult<()> {
        self.active_sender()?
            .send(&ClientEvent::ResponseCancel)
            .await
    }
}

impl ControllerInner {
    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for ModelSessionController {
    fn drop(&mut self) {
        self.inner.stop_pump();
        self.inner.conversation.stop();
    }
}

/// Send `session.update`, then `input_audio_buffer.clear` when resuming
/// after a failure, matching the local buffer that was just cleared.
async fn configure_session(
    sender: &EventSender,
    update: &ClientEvent,
    resuming: bool,
) -> BridgeResult<()> {
    sender.send(update).await?;
    if resuming {
        sender.send(&ClientEvent::InputAudioBufferClear).await?;
    }
    Ok(())
}

/// Forward conversation audio to the connection until cancelled.
async fn pump_audio(
    conversation: Arc<ConversationSession>,
    sender: EventSender,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = conversation.next_chunk() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("conversation stopped, pump exiting");
            break;
        };

        trace!(bytes = chunk.len(), "pumping audio chunk");
        let event = ClientEvent::audio_append(&chunk);
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sender.send(&event) => {
                if let Err(e) = result {
                    debug!(error = %e, "pump stopping");
                    break;
                }
            }
        }
    }
}
