//! Proxy event fan-out to control-plane subscribers.
//!
//! Each subscriber owns a bounded channel; emitters never block. A full
//! buffer drops the event for that subscriber only.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;

/// Buffered events per subscriber before drops begin.
pub const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlayerConnect,
    PlayerDisconnect,
    PlayerServerSwitch,
    ConfigUpdate,
    Ready,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Player,
    System,
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::PlayerConnect
            | EventKind::PlayerDisconnect
            | EventKind::PlayerServerSwitch => EventCategory::Player,
            EventKind::ConfigUpdate | EventKind::Ready | EventKind::Shutdown => {
                EventCategory::System
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PlayerConnect => "player_connect",
            EventKind::PlayerDisconnect => "player_disconnect",
            EventKind::PlayerServerSwitch => "player_server_switch",
            EventKind::ConfigUpdate => "config_update",
            EventKind::Ready => "ready",
            EventKind::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "player_connect" => Some(EventKind::PlayerConnect),
            "player_disconnect" => Some(EventKind::PlayerDisconnect),
            "player_server_switch" => Some(EventKind::PlayerServerSwitch),
            "config_update" => Some(EventKind::ConfigUpdate),
            "ready" => Some(EventKind::Ready),
            "shutdown" => Some(EventKind::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Successful,
    Conflicting,
    CancelledByUser,
    CancelledByProxy,
    CancelledBeforeComplete,
    Unspecified,
}

#[derive(Debug, Clone)]
pub enum Event {
    PlayerConnect {
        username: String,
        remote_addr: String,
        protocol: i32,
    },
    PlayerDisconnect {
        username: String,
        login_status: LoginStatus,
    },
    PlayerServerSwitch {
        username: String,
        from_server: Option<String>,
        to_server: String,
    },
    ConfigUpdate {
        new: Arc<Config>,
        previous: Arc<Config>,
    },
    Ready {
        bind_addr: String,
        lite: bool,
    },
    Shutdown {
        reason: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PlayerConnect { .. } => EventKind::PlayerConnect,
            Event::PlayerDisconnect { .. } => EventKind::PlayerDisconnect,
            Event::PlayerServerSwitch { .. } => EventKind::PlayerServerSwitch,
            Event::ConfigUpdate { .. } => EventKind::ConfigUpdate,
            Event::Ready { .. } => EventKind::Ready,
            Event::Shutdown { .. } => EventKind::Shutdown,
        }
    }
}

/// Subscriber-side filter. An empty kind set means every kind; when both
/// category flags are unset the subscriber receives both categories, which
/// mirrors how an empty stream request behaves on the wire.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: HashSet<EventKind>,
    pub include_player_events: bool,
    pub include_system_events: bool,
}

impl EventFilter {
    pub fn all() -> Self {
        Self {
            kinds: HashSet::new(),
            include_player_events: true,
            include_system_events: true,
        }
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::all()
        }
    }

    fn normalized(mut self) -> Self {
        if !self.include_player_events && !self.include_system_events {
            self.include_player_events = true;
            self.include_system_events = true;
        }
        self
    }

    fn accepts(&self, kind: EventKind) -> bool {
        let category_ok = match kind.category() {
            EventCategory::Player => self.include_player_events,
            EventCategory::System => self.include_system_events,
        };
        category_ok && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    filter: EventFilter,
}

/// Fan-out hub. Publishing is non-blocking for the emitter; each subscriber
/// consumes in FIFO order.
pub struct EventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter: filter.normalized(),
            },
        );
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Offers the event to every interested subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        for entry in self.subscribers.iter() {
            if !entry.filter.accepts(kind) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(kind = kind.as_str(), "dropping event for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A live subscription. Dropping it releases the registration.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}
