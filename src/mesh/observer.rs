//! Observer lists with subscription tokens
//!
//! Handlers are called synchronously, in subscription order, without any
//! lock held, so a handler may subscribe or unsubscribe while being notified.

use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    handler: Handler<T>,
}

struct Registry<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

/// A list of handlers for events of type `T`
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered until the returned token is
    /// dropped or `unsubscribe`d.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push(Entry {
                id,
                handler: Arc::new(handler),
            });
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut registry) = inner.lock() {
                        registry.entries.retain(|e| e.id != id);
                    }
                }
            })),
        }
    }

    /// Call every registered handler with `event`
    pub fn notify(&self, event: &T) {
        let handlers: Vec<Handler<T>> = match self.inner.lock() {
            Ok(registry) => registry.entries.iter().map(|e| e.handler.clone()).collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Token returned by `subscribe`; dropping it removes the handler
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the handler registered for as long as the observer list lives
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
