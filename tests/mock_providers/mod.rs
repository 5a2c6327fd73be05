//! Mock Realtime Provider
//!
//! In-process stand-in for the realtime speech-to-speech endpoint:
//! - Records the handshake (URI and auth headers)
//! - Records every client event as JSON
//! - Sends scripted server events on demand
//! - Can reject the handshake or drop connections abruptly

// Allow dead code in test infrastructure - not every test binary uses every helper
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics collector for the mock server
#[derive(Debug, Default)]
pub struct MockStats {
    pub handshakes: AtomicU64,
    pub rejected_handshakes: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub dropped_connections: AtomicU64,
}

impl MockStats {
    pub fn record_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "Handshakes: {}, Rejected: {}, Received: {}, Sent: {}, Dropped: {}",
            self.handshakes.load(Ordering::Relaxed),
            self.rejected_handshakes.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.dropped_connections.load(Ordering::Relaxed),
        )
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub mod websocket_mock;
