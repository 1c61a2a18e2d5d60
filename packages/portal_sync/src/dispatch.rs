//! Subscriber registry and fan-out for inbound push events.
//!
//! Each event is delivered synchronously to every callback registered at the
//! moment fan-out starts, in registration order. The registry is snapshotted
//! before any callback runs, so a callback may subscribe or cancel (itself or
//! another subscriber) without affecting delivery of the current event.
//! Nothing is queued for subscribers that arrive later.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

use crate::connection::ConnectionStatus;
use crate::models::Message;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entries<T> {
    next_token: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Type-erased removal, so `Subscription` does not carry the event type.
trait Detach: Send + Sync {
    fn detach(&self, token: u64);
}

impl<T: 'static> Detach for Mutex<Entries<T>> {
    fn detach(&self, token: u64) {
        let mut entries = lock(self);
        entries.callbacks.retain(|(t, _)| *t != token);
    }
}

fn lock<T>(entries: &Mutex<Entries<T>>) -> MutexGuard<'_, Entries<T>> {
    // Callbacks never run under the lock, so a poisoned registry still holds
    // a consistent list.
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered list of callbacks for one event type.
pub struct Registry<T> {
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T: 'static> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_token: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = {
            let mut entries = lock(&self.entries);
            let token = entries.next_token;
            entries.next_token += 1;
            entries.callbacks.push((token, Arc::new(callback)));
            token
        };
        let weak: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            token,
            registry: Some(registry),
        }
    }

    /// Deliver `event` to every callback registered when this call starts.
    /// Returns how many callbacks were invoked.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = lock(&self.entries)
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

/// Handle to a registered callback. Cancelling it (explicitly or by drop)
/// removes the callback; cancelling twice is a no-op.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    token: u64,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .is_some_and(|registry| registry.strong_count() > 0)
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.detach(self.token);
            debug!(token = self.token, "subscription cancelled");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Which stream of inbound events a subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Status,
}

/// An inbound event, as routed by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Message(&'a Message),
    Status(&'a ConnectionStatus),
}

/// Fan-out point between the push channel and its consumers.
///
/// Cloning yields another handle to the same registries.
#[derive(Clone, Default)]
pub struct Dispatcher {
    messages: Registry<Message>,
    statuses: Registry<ConnectionStatus>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(Event<'_>) + Send + Sync + 'static,
    {
        match kind {
            EventKind::Message => self.on_message(move |msg| callback(Event::Message(msg))),
            EventKind::Status => self.on_status(move |status| callback(Event::Status(status))),
        }
    }

    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.messages.subscribe(callback)
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.statuses.subscribe(callback)
    }

    pub fn dispatch_message(&self, msg: &Message) -> usize {
        self.messages.emit(msg)
    }

    pub fn dispatch_status(&self, status: &ConnectionStatus) -> usize {
        self.statuses.emit(status)
    }

    pub fn message_subscribers(&self) -> usize {
        self.messages.len()
    }

    pub fn status_subscribers(&self) -> usize {
        self.statuses.len()
    }
}
