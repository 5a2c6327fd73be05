//! Publish/subscribe registry for bridge events.
//!
//! Subscribers register for one [`BridgeEventKind`] and are invoked
//! synchronously, in registration order, on the publishing task. A subscriber
//! that returns an error or panics is logged and skipped; the remaining
//! subscribers still receive the event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::realtime::{ApiError, ControllerState, TurnState};

/// Speaker a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Transcript text from either side of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub role: TranscriptRole,
    pub text: String,
    /// `false` for incremental deltas
    pub is_final: bool,
    pub item_id: Option<String>,
}

/// Events published by the model session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Controller lifecycle transition
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    /// Turn-taking signal derived from protocol events
    TurnChanged { from: TurnState, to: TurnState },
    /// Server acknowledged the session
    SessionCreated { session_id: String },
    Transcript(Transcript),
    /// Text output (`response.text.*`)
    Text { text: String, is_final: bool },
    ResponseDone {
        response_id: String,
        status: String,
    },
    /// Protocol-level `error` event; the session stays open
    ApiError(ApiError),
    /// Inbound payload that could not be decoded; the event was skipped
    DecodeError { event_type: String, message: String },
    /// Fatal transport failure; published once per connection
    Failed { reason: String },
}

/// Discriminant used to subscribe to a class of [`BridgeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeEventKind {
    StateChanged,
    TurnChanged,
    SessionCreated,
    Transcript,
    Text,
    ResponseDone,
    ApiError,
    DecodeError,
    Failed,
}

impl BridgeEvent {
    pub fn kind(&self) -> BridgeEventKind {
        match self {
            BridgeEvent::StateChanged { .. } => BridgeEventKind::StateChanged,
            BridgeEvent::TurnChanged { .. } => BridgeEventKind::TurnChanged,
            BridgeEvent::SessionCreated { .. } => BridgeEventKind::SessionCreated,
            BridgeEvent::Transcript(_) => BridgeEventKind::Transcript,
            BridgeEvent::Text { .. } => BridgeEventKind::Text,
            BridgeEvent::ResponseDone { .. } => BridgeEventKind::ResponseDone,
            BridgeEvent::ApiError(_) => BridgeEventKind::ApiError,
            BridgeEvent::DecodeError { .. } => BridgeEventKind::DecodeError,
            BridgeEvent::Failed { .. } => BridgeEventKind::Failed,
        }
    }
}

/// Callback invoked for each published event of the subscribed kind.
pub type Subscriber = Arc<dyn Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event-kind to ordered-subscriber registry.
#[derive(Default)]
pub struct EventRegistry {
    subscribers: RwLock<HashMap<BridgeEventKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read();
        f.debug_struct("EventRegistry")
            .field("kinds", &subscribers.len())
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for events of `kind`.
    pub fn subscribe<F>(&self, kind: BridgeEventKind, subscriber: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(subscriber)));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: BridgeEventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Returns the number of subscribers that failed.
    pub fn publish(&self, event: &BridgeEvent) -> usize {
        let kind = event.kind();
        // Snapshot so subscribers may (un)subscribe while being called.
        let targets: Vec<(SubscriptionId, Subscriber)> = match self.subscribers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut failures = 0;
        for (id, subscriber) in targets {
            match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(?kind, subscription = id.0, error = %e, "event subscriber failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(?kind, subscription = id.0, "event subscriber panicked");
                }
            }
        }
        failures
    }
}
