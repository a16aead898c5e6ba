//! Channel adapter entry point.
//!
//! Transports (a message broker consumer, an HTTP endpoint, a test) push raw
//! event bytes into an [`InboundChannel`]; one tokio task drains the channel
//! and dispatches each delivery in arrival order.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::dispatcher::{DispatchError, EventDispatcher};

/// Sending half of an inbound delivery loop. Cheap to clone.
#[derive(Clone)]
pub struct InboundChannel {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InboundChannel {
    /// Spawn the delivery loop.
    ///
    /// The loop stops when `shutdown` fires or every `InboundChannel` clone
    /// is dropped. Its `JoinHandle` yields the number of deliveries
    /// dispatched.
    pub fn spawn(
        dispatcher: Arc<EventDispatcher>,
        capacity: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<usize>) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut delivered = 0usize;
            loop {
                let raw = tokio::select! {
                    _ = shutdown.recv() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => raw,
                        None => break,
                    },
                };
                delivered += 1;
                match dispatcher.dispatch(&raw).await {
                    Ok(result) if result.is_unmatched() => {
                        tracing::debug!(event_type = %result.event_type, "no subscription matched");
                    }
                    Ok(result) => {
                        tracing::debug!(
                            event_type = %result.event_type,
                            matches = result.reports.len(),
                            failures = result.failures().len(),
                            "event dispatched"
                        );
                    }
                    // Decode failures are already logged by the dispatcher.
                    Err(DispatchError::Decode(_)) => {}
                    Err(e) => tracing::error!(error = %e, "event dispatch failed"),
                }
            }
            tracing::debug!(delivered, "inbound channel stopped");
            delivered
        });
        (Self { tx }, handle)
    }

    /// Queue one raw event for dispatch. Waits while the channel is full.
    pub async fn deliver(&self, raw: impl Into<Vec<u8>>) -> Result<(), DispatchError> {
        self.tx
            .send(raw.into())
            .await
            .map_err(|_| DispatchError::ChannelClosed)
    }
}
