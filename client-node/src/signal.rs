//! Signal subscriptions as a capability set: a `Signal<T>` is a multicast
//! point collaborators emit on, `subscribe` hands back a `Subscription`, and
//! dropping the `Subscription` unsubscribes. `ClientNode` holds four of these
//! (node-free, node-initialized, loop-changed, core-global-added) and drops
//! them all on destruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<T> = Box<dyn FnMut(&T) + Send>;

struct Slot<T> {
    id: u64,
    callback: Arc<Mutex<Callback<T>>>,
}

struct Inner<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot<T>>>,
}

pub struct Signal<T>(Arc<Inner<T>>);

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal(self.0.clone())
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal(Arc::new(Inner {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
        }))
    }

    pub fn subscribe(&self, cb: impl FnMut(&T) + Send + 'static) -> Subscription<T> {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.slots.lock().unwrap().push(Slot {
            id,
            callback: Arc::new(Mutex::new(Box::new(cb))),
        });
        Subscription {
            id,
            inner: self.0.clone(),
        }
    }

    /// Snapshots the callback list before invoking any of them: a callback
    /// that drops its own `Subscription` to this same signal (unsubscribing
    /// itself mid-emit, which `ClientNode`'s destroy signal does) would
    /// otherwise try to re-lock `slots` while `emit` is still holding it.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<_> = self.0.slots.lock().unwrap().iter().map(|s| s.callback.clone()).collect();
        for cb in callbacks {
            (cb.lock().unwrap())(value);
        }
    }
}

pub struct Subscription<T> {
    id: u64,
    inner: Arc<Inner<T>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.inner.slots.lock().unwrap().retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn subscription_unsubscribes_on_drop() {
        let signal: Signal<u32> = Signal::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let sub = signal.subscribe(move |v| {
            seen2.fetch_add(*v, Ordering::Relaxed);
        });
        signal.emit(&1);
        drop(sub);
        signal.emit(&2);
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
