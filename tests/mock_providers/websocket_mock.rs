//! WebSocket Mock Server for the Realtime API
//!
//! Speaks just enough of the realtime protocol for the bridge: it accepts the
//! handshake, optionally greets with `session.created`, records client events
//! and forwards whatever the test scripts through [`MockRealtimeServer::send`].

use super::{MockStats, wait_until};
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Instruction pushed to every live connection.
#[derive(Debug, Clone)]
pub enum ServerCommand {
    /// Send a JSON event
    Send(Value),
    /// Send a raw text frame
    Raw(String),
    /// Send a close frame and stop
    Close,
    /// Drop the TCP stream without a closing handshake
    Drop,
}

/// What the client sent during the handshake.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub uri: String,
    pub authorization: Option<String>,
    pub beta: Option<String>,
}

/// Shared mock server state
pub struct RealtimeMockState {
    pub stats: MockStats,
    pub connection_count: AtomicU64,
    /// Reject handshakes with 401 while set
    pub reject_handshake: AtomicBool,
    /// Send `session.created` right after the handshake
    pub greet: AtomicBool,
    handshakes: Mutex<Vec<Handshake>>,
    received: Mutex<Vec<Value>>,
    commands: broadcast::Sender<ServerCommand>,
}

impl RealtimeMockState {
    fn new() -> Self {
        let (commands, _) = broadcast::channel(256);
        Self {
            stats: MockStats::default(),
            connection_count: AtomicU64::new(0),
            reject_handshake: AtomicBool::new(false),
            greet: AtomicBool::new(true),
            handshakes: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            commands,
        }
    }
}

/// Handle a single realtime WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    state: Arc<RealtimeMockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reject = state.reject_handshake.load(Ordering::SeqCst);
    let callback_state = state.clone();
    let callback = move |request: &Request, response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        callback_state.handshakes.lock().push(Handshake {
            uri: request.uri().to_string(),
            authorization: header("authorization"),
            beta: header("openai-beta"),
        });

        if reject {
            callback_state.stats.record_rejection();
            let mut error = ErrorResponse::new(Some("invalid api key".to_string()));
            *error.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(error);
        }
        callback_state.stats.record_handshake();
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let mut commands = state.commands.subscribe();
    let (mut write, mut read) = ws_stream.split();

    let conn_id = state.connection_count.fetch_add(1, Ordering::SeqCst) + 1;

    if state.greet.load(Ordering::SeqCst) {
        let created = json!({
            "type": "session.created",
            "event_id": format!("event_created_{conn_id}"),
            "session": {
                "id": format!("sess_mock_{conn_id}"),
                "model": "gpt-4o-realtime-preview",
            }
        });
        write.send(Message::Text(created.to_string().into())).await?;
        state.stats.record_sent();
    }

    let result = loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.stats.record_received();
                    match serde_json::from_str::<Value>(&text) {
                        Ok(event) => state.received.lock().push(event),
                        Err(e) => eprintln!("Mock received invalid JSON: {e}"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Err(e)) => {
                    eprintln!("Mock WebSocket error: {e}");
                    break Ok(());
                }
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(ServerCommand::Send(event)) => {
                    write.send(Message::Text(event.to_string().into())).await?;
                    state.stats.record_sent();
                }
                Ok(ServerCommand::Raw(text)) => {
                    write.send(Message::Text(text.into())).await?;
                    state.stats.record_sent();
                }
                Ok(ServerCommand::Close) => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }
                Ok(ServerCommand::Drop) => {
                    state.stats.record_drop();
                    break Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    state.connection_count.fetch_sub(1, Ordering::SeqCst);
    result
}

/// Realtime mock bound to an ephemeral localhost port
pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    pub state: Arc<RealtimeMockState>,
    handle: JoinHandle<()>,
}

impl MockRealtimeServer {
    /// Bind and start accepting connections in the background
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock realtime server");
        let addr = listener.local_addr().expect("mock server address");
        let state = Arc::new(RealtimeMockState::new());

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        eprintln!("Mock realtime connection error: {e}");
                    }
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Base URL to configure the bridge with
    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    pub fn reject_handshakes(&self, reject: bool) {
        self.state.reject_handshake.store(reject, Ordering::SeqCst);
    }

    pub fn greet(&self, greet: bool) {
        self.state.greet.store(greet, Ordering::SeqCst);
    }

    /// Push a server event to every live connection
    pub fn send(&self, event: Value) {
        let _ = self.state.commands.send(ServerCommand::Send(event));
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.state.commands.send(ServerCommand::Raw(text.into()));
    }

    pub fn close_connections(&self) {
        let _ = self.state.commands.send(ServerCommand::Close);
    }

    pub fn drop_connections(&self) {
        let _ = self.state.commands.send(ServerCommand::Drop);
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.state.handshakes.lock().clone()
    }

    pub fn connections(&self) -> u64 {
        self.state.connection_count.load(Ordering::SeqCst)
    }

    /// Every client event received so far, in arrival order
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Received events whose `type` is `event_type`
    pub fn received_of_type(&self, event_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|event| event["type"] == event_type)
            .collect()
    }

    /// Wait until at least `count` events of `event_type` have arrived
    pub async fn wait_for(&self, event_type: &str, count: usize) -> Vec<Value> {
        let arrived = wait_until(Duration::from_secs(5), || {
            self.received_of_type(event_type).len() >= count
        })
        .await;
        assert!(
            arrived,
            "timed out waiting for {count} {event_type} event(s); got {:?} ({})",
            self.received(),
            self.state.stats.summary()
        );
        self.received_of_type(event_type)
    }

    /// Wait until exactly `count` connections are open
    pub async fn wait_for_connections(&self, count: u64) {
        let reached = wait_until(Duration::from_secs(5), || self.connections() == count).await;
        assert!(
            reached,
            "expected {count} open connection(s), have {}",
            self.connections()
        );
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
