// src/bus.rs
//
// Typed publish/subscribe bus for session events.
//
// The bus is owned by its session pipeline, never process-global; tests
// construct a fresh one. Delivery order is type-specific subscribers first
// (registration order), then wildcard subscribers (registration order).
// A panicking subscriber is caught and logged without interrupting delivery.

use crate::codec::FrameError;
use crate::io::{AdapterStats, DeviceInfo};
use crate::session::ProtocolFrame;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

// ============================================================================
// Events
// ============================================================================

/// Session event.
#[derive(Clone, Debug)]
pub enum Event {
    DeviceConnected {
        device: DeviceInfo,
    },
    DeviceDisconnected {
        device: DeviceInfo,
    },
    DeviceError {
        device: Option<DeviceInfo>,
        message: String,
    },
    FrameReceived(Arc<ProtocolFrame>),
    FrameSent(Arc<ProtocolFrame>),
    FrameError {
        frame_id: u64,
        error: FrameError,
    },
    StatsUpdate(AdapterStats),
}

/// Event discriminant used for typed subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceConnected,
    DeviceDisconnected,
    DeviceError,
    FrameReceived,
    FrameSent,
    FrameError,
    StatsUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeviceConnected => "device:connected",
            EventKind::DeviceDisconnected => "device:disconnected",
            EventKind::DeviceError => "device:error",
            EventKind::FrameReceived => "frame:received",
            EventKind::FrameSent => "frame:sent",
            EventKind::FrameError => "frame:error",
            EventKind::StatsUpdate => "stats:update",
        }
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceConnected { .. } => EventKind::DeviceConnected,
            Event::DeviceDisconnected { .. } => EventKind::DeviceDisconnected,
            Event::DeviceError { .. } => EventKind::DeviceError,
            Event::FrameReceived(_) => EventKind::FrameReceived,
            Event::FrameSent(_) => EventKind::FrameSent,
            Event::FrameError { .. } => EventKind::FrameError,
            Event::StatsUpdate(_) => EventKind::StatsUpdate,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Subscriber callback.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

/// Token identifying one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventToken {
    id: u64,
    kind: Option<EventKind>,
}

struct BusInner {
    typed: HashMap<EventKind, Vec<(u64, EventHandler)>>,
    wildcard: Vec<(u64, EventHandler)>,
    next_id: u64,
}

/// Typed pub/sub with per-type and wildcard subscribers.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Mutex::new(BusInner {
                typed: HashMap::new(),
                wildcard: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Subscribe to one event variant.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> EventToken {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.typed.entry(kind).or_default().push((id, handler));
        EventToken {
            id,
            kind: Some(kind),
        }
    }

    /// Subscribe to every event variant.
    pub fn subscribe_all(&self, handler: EventHandler) -> EventToken {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.wildcard.push((id, handler));
        EventToken { id, kind: None }
    }

    pub fn unsubscribe(&self, token: EventToken) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        match token.kind {
            Some(kind) => {
                if let Some(handlers) = inner.typed.get_mut(&kind) {
                    handlers.retain(|(id, _)| *id != token.id);
                }
            }
            None => inner.wildcard.retain(|(id, _)| *id != token.id),
        }
    }

    /// Drop every subscriber, typed and wildcard, in one step.
    pub fn remove_all_listeners(&self) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.typed.clear();
        inner.wildcard.clear();
    }

    /// Deliver an event: typed subscribers first, then wildcard, each in
    /// registration order.
    pub fn publish(&self, event: &Event) {
        let inner = self.inner.lock().expect("event bus poisoned");
        if let Some(handlers) = inner.typed.get(&event.kind()) {
            for (id, handler) in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    tlog!(
                        "[bus] {} subscriber {} panicked; continuing",
                        event.kind().as_str(),
                        id
                    );
                }
            }
        }
        for (id, handler) in &inner.wildcard {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tlog!("[bus] wildcard subscriber {} panicked; continuing", id);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::DeviceType;

    fn connected_event() -> Event {
        Event::DeviceConnected {
            device: DeviceInfo::simulator(DeviceType::Uart),
        }
    }

    #[test]
    fn test_typed_then_wildcard_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.subscribe_all(Box::new(move |_| o.lock().unwrap().push("wild-1")));
        let o = order.clone();
        bus.subscribe(
            EventKind::DeviceConnected,
            Box::new(move |_| o.lock().unwrap().push("typed-1")),
        );
        let o = order.clone();
        bus.subscribe(
            EventKind::DeviceConnected,
            Box::new(move |_| o.lock().unwrap().push("typed-2")),
        );
        let o = order.clone();
        bus.subscribe_all(Box::new(move |_| o.lock().unwrap().push("wild-2")));

        bus.publish(&connected_event());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["typed-1", "typed-2", "wild-1", "wild-2"]
        );
    }

    #[test]
    fn test_typed_subscriber_only_sees_its_variant() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe(
            EventKind::DeviceDisconnected,
            Box::new(move |_| *h.lock().unwrap() += 1),
        );

        bus.publish(&connected_event());
        assert_eq!(*hits.lock().unwrap(), 0);

        bus.publish(&Event::DeviceDisconnected {
            device: DeviceInfo::simulator(DeviceType::Uart),
        });
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_interrupt() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));

        bus.subscribe(EventKind::DeviceConnected, Box::new(|_| panic!("boom")));
        let h = hits.clone();
        bus.subscribe(
            EventKind::DeviceConnected,
            Box::new(move |_| *h.lock().unwrap() += 1),
        );
        let h = hits.clone();
        bus.subscribe_all(Box::new(move |_| *h.lock().unwrap() += 1));

        bus.publish(&connected_event());
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let token = bus.subscribe(
            EventKind::DeviceConnected,
            Box::new(move |_| *h.lock().unwrap() += 1),
        );

        bus.publish(&connected_event());
        bus.unsubscribe(token);
        bus.publish(&connected_event());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_remove_all_listeners_clears_both_sets() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.subscribe(
            EventKind::DeviceConnected,
            Box::new(move |_| *h.lock().unwrap() += 1),
        );
        let h = hits.clone();
        bus.subscribe_all(Box::new(move |_| *h.lock().unwrap() += 1));

        bus.remove_all_listeners();
        bus.publish(&connected_event());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::FrameReceived.as_str(), "frame:received");
        assert_eq!(EventKind::StatsUpdate.as_str(), "stats:update");
        assert_eq!(connected_event().kind(), EventKind::DeviceConnected);
    }
}
