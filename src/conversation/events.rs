//! Inference notifications
//!
//! The three asynchronous notifications of a request, and the registry through which
//! callers subscribe to them directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;

/// One notification of an asynchronous inference request.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceEvent {
    /// An incrementally produced piece of the reply
    Fragment(String),
    /// Generation completed successfully
    Done,
    /// Generation failed, with the native error message if one was given
    Error(Option<String>),
}

impl InferenceEvent {
    pub fn is_fragment(&self) -> bool {
        matches!(self, InferenceEvent::Fragment(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, InferenceEvent::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, InferenceEvent::Error(_))
    }

    /// `Done` or `Error`
    pub fn is_terminal(&self) -> bool {
        !self.is_fragment()
    }

    pub fn as_fragment(&self) -> Option<&str> {
        match self {
            InferenceEvent::Fragment(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&str> {
        match self {
            InferenceEvent::Error(Some(s)) => Some(s),
            _ => None,
        }
    }
}

/// Receives every notification of every asynchronous request on a conversation.
///
/// Invoked on the native runtime's thread; implementations must not block for long and must
/// not release bridge wrappers.
pub trait InferenceListener: Send + Sync {
    fn on_event(&self, event: &InferenceEvent);
}

impl InferenceListener for UnboundedSender<InferenceEvent> {
    fn on_event(&self, event: &InferenceEvent) {
        // Receiver gone: the subscriber stopped listening
        let _ = self.send(event.clone());
    }
}

/// Per-conversation set of directly subscribed listeners.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: DashMap<u64, Arc<dyn InferenceListener>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn subscribe(self: &Arc<Self>, listener: Arc<dyn InferenceListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub(crate) fn dispatch(&self, event: &InferenceEvent) {
        // Snapshot first so a listener may unsubscribe from inside its callback
        let listeners: Vec<Arc<dyn InferenceListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn clear(&self) {
        self.listeners.clear();
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Keeps a listener subscribed. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.listeners.remove(&self.id);
        }
    }
}
