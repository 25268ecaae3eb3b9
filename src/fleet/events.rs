//! Fleet notification bus.
//!
//! Supervisors and the fleet manager publish; the health monitor, the context
//! aggregator and callers subscribe independently. Events are shared as
//! `Arc<FleetEvent>` so fan-out never clones snapshots.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::types::{FleetContextSnapshot, HealthCheckResult, ProviderStatus};

/// Default channel capacity for the bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

// ─── Events ──────────────────────────────────────────────────────────────────

/// A fleet notification.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    ProviderAdded { id: String },
    ProviderRemoved { id: String },
    /// Any lifecycle transition. Carries the status after the transition.
    StatusChanged(ProviderStatus),
    Connected { id: String },
    Disconnected { id: String },
    ContextUpdated(Arc<FleetContextSnapshot>),
    HealthCheck(HealthCheckResult),
    HealthCheckFailed { id: String, error: String },
    /// A start failed or a running process crashed.
    ServerError { id: String, error: String },
}

impl FleetEvent {
    /// Stable event name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            FleetEvent::ProviderAdded { .. } => "provider-added",
            FleetEvent::ProviderRemoved { .. } => "provider-removed",
            FleetEvent::StatusChanged(_) => "status-changed",
            FleetEvent::Connected { .. } => "connected",
            FleetEvent::Disconnected { .. } => "disconnected",
            FleetEvent::ContextUpdated(_) => "context-updated",
            FleetEvent::HealthCheck(_) => "health-check",
            FleetEvent::HealthCheckFailed { .. } => "health-check-failed",
            FleetEvent::ServerError { .. } => "server-error",
        }
    }

    /// The provider the event concerns; `None` for fleet-wide events.
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            FleetEvent::ProviderAdded { id }
            | FleetEvent::ProviderRemoved { id }
            | FleetEvent::Connected { id }
            | FleetEvent::Disconnected { id }
            | FleetEvent::HealthCheckFailed { id, .. }
            | FleetEvent::ServerError { id, .. } => Some(id),
            FleetEvent::StatusChanged(status) => Some(&status.id),
            FleetEvent::HealthCheck(result) => Some(&result.provider_id),
            FleetEvent::ContextUpdated(_) => None,
        }
    }

    /// Whether the event should cause a snapshot recomputation.
    pub fn triggers_recompute(&self) -> bool {
        matches!(
            self,
            FleetEvent::StatusChanged(_) | FleetEvent::Connected { .. } | FleetEvent::Disconnected { .. }
        )
    }
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// Broadcast bus for fleet events. Clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<FleetEvent>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every subscriber. Returns the number of receivers reached.
    pub fn publish(&self, event: FleetEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(Arc::new(event)) {
            Ok(count) => {
                trace!(event_type, receiver_count = count, "event published");
                count
            }
            Err(_) => {
                trace!(event_type, "no receivers for event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<FleetEvent>>,
}

impl EventReceiver {
    /// Next event. Lagged events are skipped with a warning.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Arc<FleetEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<FleetEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "event receiver lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
