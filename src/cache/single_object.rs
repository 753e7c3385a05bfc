//! Single-slot, key-fingerprinted, cancellable memoization cache.
//!
//! The cache holds at most one item. A `get` whose key is fresh relative to the
//! cached item's key attaches to it, whether its computation is still running or
//! already finished; any other key evicts the item and starts a new computation.
//! At most one computation runs per fresh key.
//!
//! Each item is reference counted: one reference for the cache slot and one per
//! attached listener. A listener gives its reference back once its cancellation
//! check returns true or its `get` future was dropped. When nothing but the slot
//! is left, the item takes itself out of the slot, the count reaches zero and the
//! computation is told to stop.
//!
//! Cancellation is cooperative. The computation only learns about it when it calls
//! [`CancellationCheck::ensure_not_cancelled`], so an abandoned computation keeps
//! running for up to one polling interval of its own choosing. Listeners are
//! released at the same points.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::oneshot;

/// Raised by [`CancellationCheck::ensure_not_cancelled`] once nobody waits for the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task cancelled")]
pub struct TaskCancelled;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("task cancelled")]
    Cancelled,
    #[error("computation failed: {0:#}")]
    Computation(Arc<anyhow::Error>),
}

impl CacheError {
    fn from_refresh(e: anyhow::Error) -> Self {
        if e.is::<TaskCancelled>()
            || matches!(
                e.downcast_ref::<crate::error::TaskError>(),
                Some(crate::error::TaskError::TaskCancelled)
            )
        {
            CacheError::Cancelled
        } else {
            CacheError::Computation(Arc::new(e))
        }
    }
}

/// The computation behind a cache.
#[async_trait]
pub trait SingleObjectRefresh: Send + Sync + 'static {
    type Input: Send + 'static;
    type Key: PartialEq + Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    fn key_of(&self, input: &Self::Input) -> Self::Key;

    /// Whether a value computed for `current` may answer a request for `requested`.
    fn is_fresh(&self, current: &Self::Key, requested: &Self::Key) -> bool {
        current == requested
    }

    /// Must call `check.ensure_not_cancelled()` periodically and return its error.
    async fn refresh(
        &self,
        input: Self::Input,
        check: CancellationCheck,
    ) -> anyhow::Result<Self::Value>;
}

type IsCancelled = Arc<dyn Fn() -> bool + Send + Sync>;
type Outcome<V> = Result<V, CacheError>;
type Slot<K, V> = Arc<Mutex<Option<Arc<CachedItem<K, V>>>>>;

struct Listener<V> {
    tx: Option<oneshot::Sender<Outcome<V>>>,
    is_cancelled: IsCancelled,
}

struct ItemInner<V> {
    outcome: Option<Outcome<V>>,
    listeners: Vec<Listener<V>>,
}

struct CachedItem<K, V> {
    key: K,
    refs: AtomicUsize,
    inner: Mutex<ItemInner<V>>,
    slot: Weak<Mutex<Option<Arc<CachedItem<K, V>>>>>,
}

enum Attach<V> {
    Waiting(oneshot::Receiver<Outcome<V>>),
    Done(Outcome<V>),
    Closed,
}

impl<K: Send + Sync + 'static, V: Clone + Send + Sync + 'static> CachedItem<K, V> {
    /// A new item with its first listener already attached: one reference for the
    /// slot and one for that listener.
    fn new(
        key: K,
        is_cancelled: IsCancelled,
        slot: &Slot<K, V>,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome<V>>) {
        let (tx, rx) = oneshot::channel();
        let item = Arc::new(Self {
            key,
            refs: AtomicUsize::new(2),
            inner: Mutex::new(ItemInner {
                outcome: None,
                listeners: vec![Listener {
                    tx: Some(tx),
                    is_cancelled,
                }],
            }),
            slot: Arc::downgrade(slot),
        });
        (item, rx)
    }

    fn try_inc_ref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
            .is_ok()
    }

    fn dec_ref(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn is_in_slot(&self, slot: &Option<Arc<CachedItem<K, V>>>) -> bool {
        slot.as_ref().is_some_and(|item| std::ptr::eq(Arc::as_ptr(item), self))
    }

    fn attach(&self, is_cancelled: IsCancelled) -> Attach<V> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = &inner.outcome {
            return Attach::Done(outcome.clone());
        }
        if !self.try_inc_ref() {
            return Attach::Closed;
        }
        let (tx, rx) = oneshot::channel();
        inner.listeners.push(Listener {
            tx: Some(tx),
            is_cancelled,
        });
        Attach::Waiting(rx)
    }

    fn complete(&self, outcome: Outcome<V>) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.listeners)
        };

        for listener in listeners {
            if let Some(tx) = listener.tx {
                let _ = tx.send(outcome.clone());
            }
        }

        // Failures and cancellations are never served from the cache.
        if outcome.is_err() {
            self.remove_from_slot();
        }
    }

    fn remove_from_slot(&self) {
        if let Some(slot) = self.slot.upgrade() {
            let mut slot = slot.lock();
            if self.is_in_slot(&slot) {
                *slot = None;
            }
        }
    }

    /// Releases the reference of every listener whose check now reports cancelled
    /// or whose receiver is gone. Returns true when the item is abandoned.
    fn run_cancellation_checks(&self) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            let mut released = 0;
            for listener in inner.listeners.iter_mut() {
                let Some(tx) = &listener.tx else { continue };
                if tx.is_closed() || (listener.is_cancelled)() {
                    if let Some(tx) = listener.tx.take() {
                        let _ = tx.send(Err(CacheError::Cancelled));
                    }
                    released += 1;
                }
            }
            inner.listeners.retain(|l| l.tx.is_some());
            released
        };

        for _ in 0..released {
            self.dec_ref();
        }

        if released > 0 {
            // Only the slot reference left: nobody is waiting, so give it up too.
            if let Some(slot) = self.slot.upgrade() {
                let mut slot = slot.lock();
                if self.is_in_slot(&slot)
                    && self
                        .refs
                        .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    *slot = None;
                }
            }
        }

        self.refs.load(Ordering::Acquire) == 0
    }
}

trait Cancellable: Send + Sync {
    fn ensure_not_cancelled(&self) -> Result<(), TaskCancelled>;
    fn is_superseded(&self) -> bool;
}

impl<K: Send + Sync + 'static, V: Clone + Send + Sync + 'static> Cancellable for CachedItem<K, V> {
    fn ensure_not_cancelled(&self) -> Result<(), TaskCancelled> {
        if self.run_cancellation_checks() {
            self.complete(Err(CacheError::Cancelled));
            return Err(TaskCancelled);
        }
        Ok(())
    }

    fn is_superseded(&self) -> bool {
        match self.slot.upgrade() {
            Some(slot) => !self.is_in_slot(&slot.lock()),
            None => true,
        }
    }
}

/// Handle passed to a running computation.
#[derive(Clone)]
pub struct CancellationCheck {
    item: Arc<dyn Cancellable>,
}

impl CancellationCheck {
    /// Runs the listeners' checks; fails once no listener is left.
    pub fn ensure_not_cancelled(&self) -> Result<(), TaskCancelled> {
        self.item.ensure_not_cancelled()
    }

    /// True once a request for a non-fresh key replaced this computation in the slot.
    pub fn is_superseded(&self) -> bool {
        self.item.is_superseded()
    }
}

pub struct CancellableSingleObjectCache<R: SingleObjectRefresh> {
    refresher: Arc<R>,
    slot: Slot<R::Key, R::Value>,
}

impl<R: SingleObjectRefresh> CancellableSingleObjectCache<R> {
    pub fn new(refresher: R) -> Self {
        Self {
            refresher: Arc::new(refresher),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn refresher(&self) -> &R {
        &self.refresher
    }

    /// Key of the item currently in the slot, if any.
    pub fn cached_key(&self) -> Option<R::Key> {
        self.slot.lock().as_ref().map(|item| item.key.clone())
    }

    /// Returns the value for `input`, sharing a computation with every concurrent
    /// caller whose key is fresh.
    ///
    /// `is_cancelled` is polled whenever the computation checks for cancellation.
    pub async fn get<F>(&self, input: R::Input, is_cancelled: F) -> Result<R::Value, CacheError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let key = self.refresher.key_of(&input);
        let is_cancelled: IsCancelled = Arc::new(is_cancelled);

        let rx = loop {
            if is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let current = self.slot.lock().clone();
            if let Some(item) = &current
                && self.refresher.is_fresh(&item.key, &key)
            {
                match item.attach(is_cancelled.clone()) {
                    Attach::Waiting(rx) => break rx,
                    Attach::Done(Err(CacheError::Cancelled)) | Attach::Closed => {}
                    Attach::Done(outcome) => return outcome,
                }
            }

            let (item, rx) = CachedItem::new(key.clone(), is_cancelled.clone(), &self.slot);
            let evicted = {
                let mut slot = self.slot.lock();
                let unchanged = match (&*slot, &current) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                if !unchanged {
                    // Lost a race with another caller; look again.
                    continue;
                }
                slot.replace(item.clone())
            };
            if let Some(evicted) = evicted {
                evicted.dec_ref();
            }

            let refresher = self.refresher.clone();
            let check = CancellationCheck { item: item.clone() };
            tokio::spawn(async move {
                // Run on its own task so a panicking refresh still completes the item.
                let refresh = tokio::spawn(async move { refresher.refresh(input, check).await });
                let outcome = match refresh.await {
                    Ok(result) => result.map_err(CacheError::from_refresh),
                    Err(e) => Err(CacheError::Computation(Arc::new(anyhow::anyhow!(
                        "cache refresh aborted: {e}"
                    )))),
                };
                item.complete(outcome);
            });
            break rx;
        };

        rx.await.unwrap_or(Err(CacheError::Cancelled))
    }
}
