use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::errors::ClientError;
use crate::core::types::{Balance, OrderHandle};

/// Closed set of observable client events. Keying the registry by this enum
/// instead of free-form strings catches typos at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Authenticated,
    Disconnected,
    Reconnecting,
    Reconnected,
    BalanceUpdated,
    OrderOpened,
    OrderClosed,
}

/// Payload delivered to event callbacks.
#[derive(Debug, Clone)]
pub enum Event {
    Connected { region: String },
    Authenticated,
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected { region: String },
    BalanceUpdated(Balance),
    OrderOpened(OrderHandle),
    OrderClosed(OrderHandle),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Authenticated => EventKind::Authenticated,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::BalanceUpdated(_) => EventKind::BalanceUpdated,
            Self::OrderOpened(_) => EventKind::OrderOpened,
            Self::OrderClosed(_) => EventKind::OrderClosed,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&Event) -> Result<(), ClientError> + Send + Sync>;

/// Token returned by `add_callback`, used to remove the registration later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Fan-out registry for unsolicited server pushes and lifecycle events.
///
/// Callbacks run in registration order; a failing callback is logged and does
/// not prevent the remaining callbacks from running.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<EventKind, Vec<(CallbackId, EventCallback)>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_callback(&self, kind: EventKind, callback: EventCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .await
            .entry(kind)
            .or_default()
            .push((id, callback));
        id
    }

    pub async fn remove_callback(&self, kind: EventKind, id: CallbackId) {
        if let Some(list) = self.callbacks.write().await.get_mut(&kind) {
            list.retain(|(cb_id, _)| *cb_id != id);
        }
    }

    pub async fn emit(&self, event: &Event) {
        let callbacks: Vec<EventCallback> = {
            let guard = self.callbacks.read().await;
            guard
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            if let Err(e) = callback(event) {
                warn!(event = ?event.kind(), error = %e, "event callback failed");
            }
        }
    }
}
