//! Typed publish/subscribe primitive.
//!
//! `publish` delivers to a snapshot of the current listeners, so a listener
//! that subscribes or unsubscribes while handling an event never disturbs the
//! in-flight delivery. The listener list lock is only held while taking that
//! snapshot.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type SubscriptionId = u64;

type SyncHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;
type AsyncHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

enum Listener<T> {
    Sync(SyncHandler<T>),
    Async(AsyncHandler<T>),
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        match self {
            Listener::Sync(h) => Listener::Sync(h.clone()),
            Listener::Async(h) => Listener::Async(h.clone()),
        }
    }
}

struct Inner<T> {
    listeners: Mutex<Vec<(SubscriptionId, Listener<T>)>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable; clones share the same listener list.
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for EventBus<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn push(&self, listener: Listener<T>) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("event bus mutex poisoned")
            .push((id, listener));
        id
    }

    /// Registers a handler that runs inline, in subscription order.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push(Listener::Sync(Arc::new(handler)))
    }

    /// Registers an async handler. `publish` spawns it, `publish_awaited` awaits it.
    pub fn subscribe_async<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.push(Listener::Async(Arc::new(move |payload| {
            Box::pin(handler(payload))
        })))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self
            .inner
            .listeners
            .lock()
            .expect("event bus mutex poisoned");
        let before = guard.len();
        guard.retain(|(sid, _)| *sid != id);
        guard.len() != before
    }

    pub fn clear(&self) {
        self.inner
            .listeners
            .lock()
            .expect("event bus mutex poisoned")
            .clear();
    }

    pub fn handlers_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .expect("event bus mutex poisoned")
            .len()
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.inner
            .listeners
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Fire-and-forget delivery.
    pub fn publish(&self, payload: T) {
        for listener in self.snapshot() {
            match listener {
                Listener::Sync(h) => h(&payload),
                Listener::Async(h) => match tokio::runtime::Handle::try_current() {
                    Ok(rt) => {
                        rt.spawn(h(payload.clone()));
                    }
                    Err(_) => warn!("async listener skipped: no tokio runtime"),
                },
            }
        }
    }

    /// Sequential delivery; returns once every listener has finished.
    pub async fn publish_awaited(&self, payload: T) {
        for listener in self.snapshot() {
            match listener {
                Listener::Sync(h) => h(&payload),
                Listener::Async(h) => h(payload.clone()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn publish_reaches_every_listener_in_order() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = seen.clone();
            bus.subscribe(move |v| seen.lock().unwrap().push((tag, *v)));
        }
        bus.publish(7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn unsubscribe_during_dispatch_does_not_disturb_delivery() {
        let bus = EventBus::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let bus2 = bus.clone();
        let first = Arc::new(Mutex::new(None::<SubscriptionId>));
        let first2 = first.clone();
        bus.subscribe(move |_| {
            if let Some(id) = *first2.lock().unwrap() {
                bus2.unsubscribe(id);
            }
        });
        let h = hits.clone();
        let id = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        *first.lock().unwrap() = Some(id);

        bus.publish(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1, "snapshot still delivers");
        bus.publish(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handlers_count(), 1);
    }

    #[test]
    fn clear_wipes_listeners() {
        let bus = EventBus::<u32>::new();
        bus.subscribe(|_| {});
        bus.subscribe(|_| {});
        bus.clear();
        assert_eq!(bus.handlers_count(), 0);
        assert!(!bus.unsubscribe(1));
    }

    #[tokio::test]
    async fn publish_awaited_runs_async_listeners_sequentially() {
        let bus = EventBus::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.subscribe_async(move |v| {
            let o1 = o1.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                o1.lock().unwrap().push(("slow", v));
            }
        });
        let o2 = order.clone();
        bus.subscribe(move |v| o2.lock().unwrap().push(("sync", *v)));

        bus.publish_awaited(3).await;
        assert_eq!(*order.lock().unwrap(), vec![("slow", 3), ("sync", 3)]);
    }
}
