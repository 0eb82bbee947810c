//! Controller: coalesces concurrent requests per key onto one fetch.

use crate::fetch::{Completion, Fetch, FetchFactory};
use crate::key::RequestKey;
use crate::reentrancy::DebugReentrancy;
use crate::table::{InFlightTable, Slot};
use core::future::Future;
use core::hash::BuildHasher;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

type Callback<R> = Box<dyn FnOnce(R) + Send + 'static>;

/// One key's in-flight state: the fetch serving it and everyone waiting.
struct InFlight<R, T> {
    fetch: Arc<T>,
    waiters: Vec<Callback<R>>,
}

type Table<R, T, S> = InFlightTable<RequestKey, InFlight<R, T>, S>;

struct Shared<R, F, S>
where
    F: FetchFactory<R>,
{
    factory: F,
    reentrancy: DebugReentrancy,
    table: Mutex<Table<R, F::Fetch, S>>,
}

/// Coalesces requests for the same [`RequestKey`] onto a single fetch.
///
/// Cloning a controller is cheap and yields a handle to the same table.
pub struct Controller<R, F, S = RandomState>
where
    F: FetchFactory<R>,
{
    shared: Arc<Shared<R, F, S>>,
}

impl<R, F, S> Clone for Controller<R, F, S>
where
    F: FetchFactory<R>,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("fetch was abandoned before producing a result")]
    Abandoned,
}

/// Future resolving to the result of a coalesced request.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Pending<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for Pending<R> {
    type Output = Result<R, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .rx
            .poll_unpin(cx)
            .map_err(|_| WaitError::Abandoned)
    }
}

/// Holds a completion's outcome back until its entry is in the table.
///
/// A factory may complete or drop `done` before `build` returns, including
/// by panicking. Reaching the table from there would re-enter its lock, so
/// the outcome is parked and settled by `request` once the entry exists.
struct Gate<R> {
    state: Mutex<GateState<R>>,
}

enum GateState<R> {
    Building,
    Armed,
    Parked(Option<R>),
}

impl<R> Gate<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Building),
        }
    }

    /// Let `outcome` through once armed; before that, park it.
    fn pass(&self, outcome: Option<R>) -> Option<Option<R>> {
        let mut state = self.state.lock();
        match *state {
            GateState::Building => {
                *state = GateState::Parked(outcome);
                None
            }
            _ => Some(outcome),
        }
    }

    /// Arm the gate, returning whatever was parked while building.
    fn arm(&self) -> Option<Option<R>> {
        match core::mem::replace(&mut *self.state.lock(), GateState::Armed) {
            GateState::Parked(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl<R, F> Controller<R, F>
where
    R: Clone + Send + 'static,
    F: FetchFactory<R> + 'static,
{
    pub fn new(factory: F) -> Self {
        Self::from_table(factory, InFlightTable::new())
    }
}

impl<R, F, S> Controller<R, F, S>
where
    R: Clone + Send + 'static,
    F: FetchFactory<R> + 'static,
    S: BuildHasher + Send + 'static,
{
    pub fn with_hasher(factory: F, hasher: S) -> Self {
        Self::from_table(factory, InFlightTable::with_hasher(hasher))
    }

    /// Pre-size the table for `capacity` keys in flight at once.
    pub fn with_capacity_and_hasher(factory: F, capacity: usize, hasher: S) -> Self {
        Self::from_table(
            factory,
            InFlightTable::with_capacity_and_hasher(capacity, hasher),
        )
    }

    fn from_table(factory: F, table: Table<R, F::Fetch, S>) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                reentrancy: DebugReentrancy::new(),
                table: Mutex::new(table),
            }),
        }
    }

    /// Request the result for `key`.
    ///
    /// Starts a fetch if none is in flight for `key`, otherwise joins the
    /// existing one. `on_complete` runs exactly once, possibly on another
    /// thread, after the fetch completes. Callbacks for one key run in the
    /// order they were registered. Returns the fetch serving the request.
    pub fn request<C>(&self, key: RequestKey, on_complete: C) -> Arc<F::Fetch>
    where
        C: FnOnce(R) + Send + 'static,
    {
        Shared::request(&self.shared, key, Box::new(on_complete))
    }

    /// Like [`request`](Self::request), but hands back a future instead of
    /// taking a callback.
    pub fn wait(&self, key: RequestKey) -> (Arc<F::Fetch>, Pending<R>) {
        let (tx, rx) = oneshot::channel();
        let fetch = self.request(key, move |result| {
            // The receiver may have been dropped; nobody is left to tell.
            let _ = tx.send(result);
        });
        (fetch, Pending { rx })
    }

    /// Number of keys with a fetch in flight.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }

    pub fn contains_key(&self, key: &RequestKey) -> bool {
        self.shared.lock().contains_key(key)
    }

    /// Number of callbacks waiting on `key`, if it is in flight.
    pub fn waiters(&self, key: &RequestKey) -> Option<usize> {
        let table = self.shared.lock();
        let slot = table.find(key)?;
        table.get(slot).map(|entry| entry.waiters.len())
    }

    /// Snapshot of the keys currently in flight.
    pub fn keys(&self) -> Vec<RequestKey> {
        self.shared.lock().keys().cloned().collect()
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }
}

impl<R, F, S> Shared<R, F, S>
where
    R: Clone + Send + 'static,
    F: FetchFactory<R> + 'static,
    S: BuildHasher + Send + 'static,
{
    fn lock(&self) -> crate::reentrancy::Locked<'_, Table<R, F::Fetch, S>> {
        self.reentrancy.lock(&self.table)
    }

    fn request(this: &Arc<Self>, key: RequestKey, callback: Callback<R>) -> Arc<F::Fetch> {
        let mut table = this.lock();

        if let Some((slot, entry)) = table.find_mut(&key) {
            entry.waiters.push(callback);
            let fetch = Arc::clone(&entry.fetch);
            let waiting = entry.waiters.len();
            // Still under the lock: the fetch may have finished between the
            // lookup and the append while its completion waits on us.
            let cached = if fetch.has_completed() {
                fetch.cached_result()
            } else {
                None
            };
            match cached {
                Some(result) => {
                    let served = table.remove(slot).map(|(_, entry)| entry.waiters);
                    drop(table);
                    let waiters = served.unwrap_or_default();
                    debug!(
                        key = %key,
                        waiters = waiters.len(),
                        "fetch already completed, replaying cached result"
                    );
                    deliver(&key, waiters, result);
                }
                None => {
                    drop(table);
                    debug!(key = %key, waiters = waiting, "attached to in-flight fetch");
                }
            }
            return fetch;
        }

        let gate = Arc::new(Gate::new());
        let mut built = None;
        let inserted = table.insert_with(key.clone(), |slot| {
            let shared = Arc::clone(this);
            let done_gate = Arc::clone(&gate);
            let done_key = key.clone();
            let done = Completion::with_notify(
                key.clone(),
                Box::new(move |outcome: Option<R>| {
                    if let Some(outcome) = done_gate.pass(outcome) {
                        match outcome {
                            Some(result) => shared.finish(&done_key, slot, result),
                            None => shared.abandon(&done_key, slot),
                        }
                    }
                }),
            );
            let fetch = Arc::new(this.factory.build(&key, done));
            built = Some(Arc::clone(&fetch));
            InFlight {
                fetch,
                waiters: vec![callback],
            }
        });
        let slot = inserted.expect("key was absent under the same lock");
        let fetch = built.expect("insert_with builds the fetch on success");

        // The completion reported while `build` ran: settle the entry here
        // and never start the fetch.
        if let Some(outcome) = gate.arm() {
            let retired = table.remove(slot).map(|(_, entry)| entry.waiters);
            drop(table);
            let waiters = retired.unwrap_or_default();
            match outcome {
                Some(result) => {
                    debug!(key = %key, "fetch completed while being built");
                    deliver(&key, waiters, result);
                }
                None => warn!(
                    key = %key,
                    waiters = waiters.len(),
                    "fetch abandoned while being built, releasing its waiters"
                ),
            }
            return fetch;
        }
        drop(table);

        debug!(key = %key, "starting new fetch");
        fetch.start();
        fetch
    }

    /// Completion path. The slot pins the entry's generation, so a stale
    /// completion can never serve a newer entry for the same key.
    fn finish(&self, key: &RequestKey, slot: Slot, result: R) {
        let served = self.lock().remove(slot);
        match served {
            Some((_, entry)) => {
                debug!(key = %key, waiters = entry.waiters.len(), "fetch completed, dispatching");
                deliver(key, entry.waiters, result);
            }
            // Only the cached-result replay removes an entry ahead of its
            // completion, and it has already served every waiter.
            None => debug!(key = %key, "fetch completed after its waiters were served"),
        }
    }

    fn abandon(&self, key: &RequestKey, slot: Slot) {
        let retired = self.lock().remove(slot);
        if let Some((_, entry)) = retired {
            warn!(
                key = %key,
                waiters = entry.waiters.len(),
                "fetch abandoned, releasing its waiters"
            );
        }
    }
}

/// Hand `result` to every waiter in registration order. The last waiter gets
/// the original value, the others clones of it. A panicking waiter unwinds
/// through here and the waiters after it are dropped uncalled.
fn deliver<R: Clone>(key: &RequestKey, waiters: Vec<Callback<R>>, result: R) {
    let mut waiters = waiters.into_iter();
    let last = waiters.next_back();
    let mut delivered = 0usize;
    for waiter in waiters {
        waiter(result.clone());
        delivered += 1;
    }
    if let Some(waiter) = last {
        waiter(result);
        delivered += 1;
    }
    trace!(key = %key, delivered, "result delivered");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Fetch double completed by hand through `fire`.
    struct Manual {
        done: StdMutex<Option<Completion<u32>>>,
        cached: StdMutex<Option<u32>>,
        starts: AtomicUsize,
    }

    impl Manual {
        fn cache(&self, v: u32) {
            *self.cached.lock().unwrap() = Some(v);
        }
        fn fire(&self, v: u32) {
            self.cache(v);
            let done = self.done.lock().unwrap().take().expect("fired twice");
            done.complete(v);
        }
    }

    impl Fetch<u32> for Manual {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn has_completed(&self) -> bool {
            self.cached.lock().unwrap().is_some()
        }
        fn cached_result(&self) -> Option<u32> {
            *self.cached.lock().unwrap()
        }
    }

    fn manual(_: &RequestKey, done: Completion<u32>) -> Manual {
        Manual {
            done: StdMutex::new(Some(done)),
            cached: StdMutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }

    type Log = Arc<StdMutex<Vec<(&'static str, u32)>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl FnOnce(u32) + Send + 'static {
        let log = Arc::clone(log);
        move |v| log.lock().unwrap().push((tag, v))
    }

    #[test]
    fn second_request_joins_first_fetch() {
        let c = Controller::new(manual);
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let a = c.request(key.clone(), recorder(&log, "a"));
        let b = c.request(key.clone(), recorder(&log, "b"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.starts.load(Ordering::SeqCst), 1);
        assert_eq!(c.waiters(&key), Some(2));

        a.fire(5);
        assert_eq!(*log.lock().unwrap(), vec![("a", 5), ("b", 5)]);
        assert!(!c.contains_key(&key));
        assert!(c.is_empty());
    }

    #[test]
    fn cached_result_replays_to_every_waiter_once() {
        let c = Controller::new(manual);
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let a = c.request(key.clone(), recorder(&log, "a"));
        // Completed, but the completion has not reached the controller yet.
        a.cache(9);
        let b = c.request(key.clone(), recorder(&log, "b"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*log.lock().unwrap(), vec![("a", 9), ("b", 9)]);
        assert!(c.is_empty());

        // The late completion must not deliver again.
        a.fire(9);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn late_completion_does_not_serve_next_generation() {
        let c = Controller::new(manual);
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let first = c.request(key.clone(), recorder(&log, "a"));
        first.cache(1);
        c.request(key.clone(), recorder(&log, "b"));
        let second = c.request(key.clone(), recorder(&log, "c"));
        assert!(!Arc::ptr_eq(&first, &second));

        first.fire(1);
        assert_eq!(c.waiters(&key), Some(1), "new generation keeps its waiter");

        second.fire(2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("c", 2)]
        );
    }

    #[test]
    fn dropped_completion_releases_the_key() {
        let c = Controller::new(manual);
        let key = RequestKey::single("id1");
        let (fetch, pending) = c.wait(key.clone());
        drop(fetch.done.lock().unwrap().take());
        assert!(!c.contains_key(&key));
        assert_eq!(futures::executor::block_on(pending), Err(WaitError::Abandoned));
    }

    #[test]
    fn panicking_factory_leaves_table_untouched() {
        let fail = std::sync::atomic::AtomicBool::new(true);
        let c = Controller::new(move |key: &RequestKey, done: Completion<u32>| {
            if fail.swap(false, Ordering::SeqCst) {
                panic!("factory failed");
            }
            manual(key, done)
        });
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            c.request(key.clone(), recorder(&log, "lost"));
        }));
        assert!(res.is_err());
        assert_eq!(c.len(), 0);
        assert!(!c.contains_key(&key));

        let fetch = c.request(key.clone(), recorder(&log, "retry"));
        assert_eq!(fetch.starts.load(Ordering::SeqCst), 1);
        fetch.fire(4);
        assert_eq!(*log.lock().unwrap(), vec![("retry", 4)]);
        assert!(c.is_empty());
    }

    #[test]
    fn completion_fired_inside_build_is_delivered_once() {
        let c = Controller::new(|key: &RequestKey, done: Completion<u32>| {
            done.complete(8);
            let fetch = manual(key, Completion::from_fn(key.clone(), |_| {}));
            fetch.cache(8);
            fetch
        });
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let fetch = c.request(key.clone(), recorder(&log, "a"));
        assert_eq!(*log.lock().unwrap(), vec![("a", 8)]);
        assert_eq!(fetch.starts.load(Ordering::SeqCst), 0, "settled fetch is not started");
        assert!(c.is_empty());
    }

    #[test]
    fn completion_dropped_inside_build_releases_the_key() {
        let c = Controller::new(|key: &RequestKey, done: Completion<u32>| {
            drop(done);
            manual(key, Completion::from_fn(key.clone(), |_| {}))
        });
        let key = RequestKey::single("id1");
        let (fetch, pending) = c.wait(key.clone());
        assert_eq!(fetch.starts.load(Ordering::SeqCst), 0);
        assert!(!c.contains_key(&key));
        assert_eq!(futures::executor::block_on(pending), Err(WaitError::Abandoned));
    }

    #[test]
    fn panicking_callback_drops_later_waiters_but_releases_the_key() {
        let c = Controller::new(manual);
        let log: Log = Default::default();
        let key = RequestKey::single("id1");

        let fetch = c.request(key.clone(), |_| panic!("callback failed"));
        c.request(key.clone(), recorder(&log, "after"));
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fetch.fire(1)));
        assert!(res.is_err());
        assert!(log.lock().unwrap().is_empty(), "later waiters are not called");
        assert!(c.is_empty());

        c.request(key.clone(), recorder(&log, "next")).fire(2);
        assert_eq!(*log.lock().unwrap(), vec![("next", 2)]);
    }

    #[test]
    fn keys_snapshot_lists_in_flight_keys() {
        let c = Controller::new(manual);
        let a = RequestKey::single("a");
        let b = RequestKey::new(["b", "c"]).unwrap();
        let fa = c.request(a.clone(), |_| {});
        c.request(b.clone(), |_| {});
        let mut keys = c.keys();
        keys.sort();
        assert_eq!(keys, vec![a.clone(), b.clone()]);
        assert_eq!(c.len(), 2);

        fa.fire(0);
        assert_eq!(c.keys(), vec![b]);
        assert_eq!(c.waiters(&a), None);
    }
}
