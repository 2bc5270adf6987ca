use std::sync::Arc;

use tokio::sync::watch;

/// Single source of truth for a piece of shared state.
///
/// Readers always dereference the latest snapshot, so async callbacks never
/// observe a stale capture. Writers go through copy-on-write: a snapshot a
/// consumer still holds is never mutated, and a new `Arc` is published only
/// when the update changed something.
pub struct Observable<T> {
    tx: watch::Sender<Arc<T>>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(value));
        Self { tx }
    }

    pub fn snapshot(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    /// Read without cloning the `Arc`. The closure must not block.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }

    /// Mutate the state. Subscribers are notified only when `f` returns true.
    /// `f` must leave the value untouched when it returns false.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(|current| {
            if let Some(value) = Arc::get_mut(current) {
                return f(value);
            }
            let mut draft = T::clone(&**current);
            let modified = f(&mut draft);
            if modified {
                *current = Arc::new(draft);
            }
            modified
        })
    }

    /// Publish a whole new value.
    pub fn replace(&self, value: T) {
        self.tx.send_replace(Arc::new(value));
    }
}
