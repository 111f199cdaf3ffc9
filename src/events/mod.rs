//! Typed publish/subscribe event bus.
//!
//! Every observable signal from the client flows through one [`EventBus`] as
//! a [`ClientEvent`] variant, keyed by its [`EventKind`] discriminant so
//! handler registration is checked per event at compile time. Dispatch is
//! synchronous and inline on the emitting context, in registration order.
//! Each handler runs inside its own panic boundary: a faulty subscriber is
//! logged and skipped, never allowed to break emission to the remaining
//! handlers or to the emitter itself.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::errors::EmbedError;
use crate::messages::{Message, TranscriptionEvent};
use crate::session::{SessionMode, SessionState};

/// Every event the client can emit, with its payload.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChange(SessionState),
    Connected { mode: SessionMode },
    Disconnected { mode: SessionMode, reason: Option<String> },
    Reconnecting,
    Reconnected,
    ConnectionStateChanged(String),
    ConnectionQualityChanged { participant: String, quality: String },
    Error(EmbedError),
    Message(Message),
    Transcription(TranscriptionEvent),
    AssistantSpeaking(bool),
    MicrophoneMuted(bool),
    Tool(Value),
    KnowledgeUsed(Value),
    Metrics(Value),
    BargeIn(Value),
    CallEnding(Value),
}

/// Discriminant for [`ClientEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ConnectionStateChanged,
    ConnectionQualityChanged,
    Error,
    Message,
    Transcription,
    AssistantSpeaking,
    MicrophoneMuted,
    Tool,
    KnowledgeUsed,
    Metrics,
    BargeIn,
    CallEnding,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::StateChange(_) => EventKind::StateChange,
            ClientEvent::Connected { .. } => EventKind::Connected,
            ClientEvent::Disconnected { .. } => EventKind::Disconnected,
            ClientEvent::Reconnecting => EventKind::Reconnecting,
            ClientEvent::Reconnected => EventKind::Reconnected,
            ClientEvent::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            ClientEvent::ConnectionQualityChanged { .. } => EventKind::ConnectionQualityChanged,
            ClientEvent::Error(_) => EventKind::Error,
            ClientEvent::Message(_) => EventKind::Message,
            ClientEvent::Transcription(_) => EventKind::Transcription,
            ClientEvent::AssistantSpeaking(_) => EventKind::AssistantSpeaking,
            ClientEvent::MicrophoneMuted(_) => EventKind::MicrophoneMuted,
            ClientEvent::Tool(_) => EventKind::Tool,
            ClientEvent::KnowledgeUsed(_) => EventKind::KnowledgeUsed,
            ClientEvent::Metrics(_) => EventKind::Metrics,
            ClientEvent::BargeIn(_) => EventKind::BargeIn,
            ClientEvent::CallEnding(_) => EventKind::CallEnding,
        }
    }
}

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
    once: bool,
}

/// Opaque handle returned by `on`/`once`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    kind: EventKind,
    id: u64,
}

/// Synchronous typed event bus.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    registry: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Register a handler for an event kind. Handlers fire in registration
    /// order until unregistered.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), false)
    }

    /// Register a handler that fires at most once, then unregisters itself.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), true)
    }

    fn register(&self, kind: EventKind, handler: Handler, once: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().entry(kind).or_default().push(Subscriber {
            id,
            handler,
            once,
        });
        HandlerId { kind, id }
    }

    /// Unregister a previously registered handler. Unknown handles are a
    /// no-op.
    pub fn off(&self, handle: HandlerId) {
        let mut registry = self.registry.write();
        if let Some(subscribers) = registry.get_mut(&handle.kind) {
            subscribers.retain(|s| s.id != handle.id);
        }
    }

    /// Remove all handlers for one event kind, or every handler when `kind`
    /// is `None`.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut registry = self.registry.write();
        match kind {
            Some(kind) => {
                registry.remove(&kind);
            }
            None => registry.clear(),
        }
    }

    /// Emit an event to every currently registered handler for its kind.
    ///
    /// The registry lock is not held while handlers run, so handlers may
    /// re-enter the bus (register, unregister, emit).
    pub fn emit(&self, event: ClientEvent) {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler, bool)> = {
            let registry = self.registry.read();
            match registry.get(&kind) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|s| (s.id, Arc::clone(&s.handler), s.once))
                    .collect(),
                None => return,
            }
        };

        let mut spent = Vec::new();
        for (id, handler, once) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!("Event handler for {:?} panicked; continuing dispatch", kind);
            }
            if once {
                spent.push(id);
            }
        }

        if !spent.is_empty() {
            let mut registry = self.registry.write();
            if let Some(subscribers) = registry.get_mut(&kind) {
                subscribers.retain(|s| !spent.contains(&s.id));
            }
        }
    }

    /// Number of handlers registered for an event kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry.read().get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn count_handler(count: &Arc<AtomicUsize>) -> impl Fn(&ClientEvent) + Send + Sync {
        let count = Arc::clone(count);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_on_emit_off() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = bus.on(EventKind::Reconnecting, count_handler(&count));

        bus.emit(ClientEvent::Reconnecting);
        bus.emit(ClientEvent::Reconnecting);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.off(handle);
        bus.emit(ClientEvent::Reconnecting);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.once(EventKind::Reconnected, count_handler(&count));

        bus.emit(ClientEvent::Reconnected);
        bus.emit(ClientEvent::Reconnected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(EventKind::Reconnected), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_break_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::AssistantSpeaking, |_| panic!("faulty subscriber"));
        bus.on(EventKind::AssistantSpeaking, count_handler(&count));

        bus.emit(ClientEvent::AssistantSpeaking(true));
        assert_eq!(count.load(Ordering::SeqCst), 1, "later handler still ran");
        assert_eq!(bus.handler_count(EventKind::AssistantSpeaking), 2);
    }

    #[test]
    fn test_events_are_kind_scoped() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::MicrophoneMuted, count_handler(&count));

        bus.emit(ClientEvent::AssistantSpeaking(false));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.emit(ClientEvent::MicrophoneMuted(true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_scoped_and_global() {
        let bus = EventBus::new();
        bus.on(EventKind::Reconnecting, |_| {});
        bus.on(EventKind::Reconnected, |_| {});

        bus.remove_all(Some(EventKind::Reconnecting));
        assert_eq!(bus.handler_count(EventKind::Reconnecting), 0);
        assert_eq!(bus.handler_count(EventKind::Reconnected), 1);

        bus.remove_all(None);
        assert_eq!(bus.handler_count(EventKind::Reconnected), 0);
    }

    #[test]
    fn test_handler_may_reenter_bus() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let bus_clone = Arc::clone(&bus);
        let count_clone = Arc::clone(&count);
        bus.on(EventKind::Reconnecting, move |_| {
            bus_clone.on(EventKind::Reconnected, {
                let count = Arc::clone(&count_clone);
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        });

        bus.emit(ClientEvent::Reconnecting);
        bus.emit(ClientEvent::Reconnected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
