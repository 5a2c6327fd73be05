//! Persistent WebSocket connection to the realtime endpoint.
//!
//! One task per connection owns both halves of the socket. It forwards
//! queued client events and dispatches inbound messages, in arrival order,
//! to a single [`ServerEventHandler`]. A transport failure or an unparseable
//! message closes the connection and is reported to the handler exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use super::base::ConnectionState;
use super::config::RealtimeSettings;
use super::messages::{ClientEvent, ParseError, ServerEvent};
use crate::errors::{BridgeError, BridgeResult};

/// Capacity of the outgoing message queue.
const WS_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the connection task to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver of inbound protocol traffic. Called on the connection task.
pub trait ServerEventHandler: Send + Sync + 'static {
    fn on_event(&self, event: ServerEvent);

    /// A known event whose payload could not be decoded; the connection stays open.
    fn on_invalid_event(&self, event_type: String, error: BridgeError);

    /// The connection failed and is now closed. Called at most once.
    fn on_fatal(&self, error: BridgeError);
}

struct Shared {
    state: Mutex<ConnectionState>,
    /// Set once the connection has ended, by failure or by `close`
    terminated: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Move from `Connecting` to `Connected` unless the connection was
    /// terminated meanwhile. Check and transition happen under one lock.
    fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        if self.terminated.load(Ordering::SeqCst) || *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Connected;
        true
    }

    /// Move to `Closed`. Returns `true` for the first caller only.
    fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(ConnectionState::Closed);
        self.cancel.cancel();
        true
    }
}

/// Cloneable handle for queueing client events on a connection.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
}

impl EventSender {
    fn encode(&self, event: &ClientEvent) -> BridgeResult<Message> {
        if *self.shared.state.lock() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }
        let json = serde_json::to_string(event)?;
        Ok(Message::Text(json.into()))
    }

    /// Queue an event, waiting for room in the outgoing queue.
    pub async fn send(&self, event: &ClientEvent) -> BridgeResult<()> {
        let message = self.encode(event)?;
        trace!(event_type = event.event_type(), "queueing client event");
        self.tx
            .send(message)
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    /// Queue an event without waiting. Fails if the queue is full.
    pub fn try_send(&self, event: &ClientEvent) -> BridgeResult<()> {
        let message = self.encode(event)?;
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BridgeError::Socket("outgoing queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => BridgeError::NotConnected,
        })
    }
}

/// Lifecycle of one persistent connection: Disconnected, Connecting,
/// Connected, Closed.
pub struct ProtocolConnection {
    settings: RealtimeSettings,
    shared: Arc<Shared>,
    sender: Mutex<Option<EventSender>>,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl ProtocolConnection {
    pub fn new(settings: RealtimeSettings, span: Span) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                terminated: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            sender: Mutex::new(None),
            task: Mutex::new(None),
            span,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Perform the WebSocket handshake and start the connection task.
    ///
    /// On failure the state returns to `Disconnected` and the call may be retried.
    pub async fn connect(&self, handler: Arc<dyn ServerEventHandler>) -> BridgeResult<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Closed => {
                    return Err(BridgeError::Connection("connection is closed".to_string()));
                }
                other => {
                    return Err(BridgeError::Connection(format!(
                        "connect called while {other}"
                    )));
                }
            }
        }

        let result = self.handshake().await;
        let ws_stream = match result {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!(parent: &self.span, error = %e, "realtime handshake failed");
                return Err(e);
            }
        };

        // `close` may have run while the handshake was in flight.
        if !self.shared.mark_connected() {
            return Err(BridgeError::Connection("connection is closed".to_string()));
        }

        info!(parent: &self.span, "connected to realtime endpoint");

        let (tx, rx) = mpsc::channel::<Message>(WS_CHANNEL_CAPACITY);
        *self.sender.lock() = Some(EventSender {
            tx,
            shared: self.shared.clone(),
        });

        let shared = self.shared.clone();
        let handle = tokio::spawn(
            run_connection(ws_stream, rx, shared, handler).instrument(self.span.clone()),
        );
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn handshake(
        &self,
    ) -> BridgeResult<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let request = self.settings.client_request()?;
        debug!(parent: &self.span, url = %request.uri(), "opening realtime connection");
        match tokio::time::timeout(self.settings.connect_timeout(), connect_async(request)).await {
            Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
            Ok(Err(e)) => Err(BridgeError::Connection(e.to_string())),
            Err(_) => Err(BridgeError::Connection(format!(
                "handshake timed out after {}ms",
                self.settings.connect_timeout_ms
            ))),
        }
    }

    /// Handle for sending events, available while connected.
    pub fn sender(&self) -> BridgeResult<EventSender> {
        self.sender.lock().clone().ok_or(BridgeError::NotConnected)
    }

    /// Serialize and queue a client event.
    pub async fn send(&self, event: &ClientEvent) -> BridgeResult<()> {
        let sender = self.sender()?;
        sender.send(event).await
    }

    /// Close the connection and wait for its task to finish. Idempotent.
    pub async fn close(&self) {
        if self.shared.terminate() {
            info!(parent: &self.span, "closing realtime connection");
        }
        self.sender.lock().take();

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                warn!(parent: &self.span, "connection task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for ProtocolConnection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_connection<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut rx: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    handler: Arc<dyn ServerEventHandler>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let failure = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break None,

            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break None };
                if let Err(e) = ws_sink.send(message).await {
                    break Some(BridgeError::Socket(format!("send failed: {e}")));
                }
            }

            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerEvent::parse(&text) {
                    Ok(event) => handler.on_event(event),
                    Err(ParseError::InvalidEvent { event_type, reason }) => {
                        handler.on_invalid_event(event_type, BridgeError::Decode(reason));
                    }
                    Err(e @ ParseError::Malformed(_)) => {
                        break Some(BridgeError::Socket(e.to_string()));
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                        break Some(BridgeError::Socket(format!("pong failed: {e}")));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    break Some(BridgeError::Socket(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(BridgeError::Socket(e.to_string())),
                None => break Some(BridgeError::Socket("connection ended".to_string())),
            },
        }
    };

    match failure {
        Some(error) => {
            if shared.terminate() {
                error!(error = %error, "realtime connection failed");
                handler.on_fatal(error);
            }
        }
        None => {
            let _ = ws_sink.send(Message::Close(None)).await;
            debug!("connection task stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    impl ServerEventHandler for NoopHandler {
        fn on_event(&self, _event: ServerEvent) {}
        fn on_invalid_event(&self, _event_type: String, _error: BridgeError) {}
        fn on_fatal(&self, _error: BridgeError) {}
    }

    fn unreachable_settings() -> RealtimeSettings {
        RealtimeSettings {
            base_url: "ws://127.0.0.1:1/v1/realtime".to_string(),
            connect_timeout_ms: 500,
            ..RealtimeSettings::new("sk-test")
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let connection = ProtocolConnection::new(RealtimeSettings::new("sk-test"), Span::none());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let result = connection.send(&ClientEvent::InputAudioBufferCommit).await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failed_handshake_allows_retry() {
        let connection = ProtocolConnection::new(unreachable_settings(), Span::none());

        let first = connection.connect(Arc::new(NoopHandler)).await;
        assert!(matches!(first, Err(BridgeError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let second = connection.connect(Arc::new(NoopHandler)).await;
        assert!(matches!(second, Err(BridgeError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let connection = ProtocolConnection::new(unreachable_settings(), Span::none());
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        let result = connection.connect(Arc::new(NoopHandler)).await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_during_handshake_stays_closed() {
        let connection = ProtocolConnection::new(RealtimeSettings::new("sk-test"), Span::none());
        connection.shared.set_state(ConnectionState::Connecting);
        connection.close().await;

        assert!(!connection.shared.mark_connected());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_mark_connected_from_connecting() {
        let connection = ProtocolConnection::new(RealtimeSettings::new("sk-test"), Span::none());
        assert!(!connection.shared.mark_connected());

        connection.shared.set_state(ConnectionState::Connecting);
        assert!(connection.shared.mark_connected());
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_dialing() {
        let settings = RealtimeSettings {
            base_url: "http://localhost/realtime".to_string(),
            ..RealtimeSettings::new("sk-test")
        };
        let connection = ProtocolConnection::new(settings, Span::none());
        let result = connection.connect(Arc::new(NoopHandler)).await;
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
