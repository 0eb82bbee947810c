//! inflight-coalesce: share one in-flight fetch among every concurrent
//! request for the same key.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: callers asking for the same `RequestKey` while a fetch for it is
//!   running join that fetch instead of starting another; when it completes,
//!   every caller gets the result and the key is forgotten.
//! - Layers:
//!   - InFlightTable<K, V, S>: hash index over generational slot storage.
//!     Entries are addressed by `Slot` handles that never resolve again once
//!     their entry is gone, even if the same key comes back.
//!   - Controller<R, F, S>: public API. Owns the table behind one lock, builds
//!     fetches through an injected `FetchFactory`, and fans results out.
//!   - Fetch / FetchFactory / Completion: the narrow seam to whatever does
//!     the real lookup. `BlockingFactory` is the stock implementation.
//!
//! Per-key lifecycle
//! - Absent -> InFlight on the first request: the factory builds a fetch,
//!   the entry records it with the caller's callback, and the fetch starts.
//! - InFlight accumulates callbacks in registration order.
//! - InFlight -> Absent when the fetch's `Completion` fires: the entry is
//!   removed and every callback receives the result, in order.
//!
//! Race closing
//! - A fetch caches its result before firing its completion. A caller that
//!   attaches in that window sees `has_completed()` under the same lock as its
//!   append, replays the cached result to the whole list, and removes the
//!   entry. The completion that arrives afterwards carries the slot of the
//!   entry it was built for; finding that slot gone, it does nothing, since
//!   every callback of that generation has already been served. Keying the
//!   completion by slot rather than by `RequestKey` also keeps a late
//!   completion away from a newer entry for the same key.
//!
//! Locking
//! - One `parking_lot::Mutex` around the table. Lookup, insert, append, the
//!   completed-check and removal happen under it.
//! - Callbacks run after the lock is released, and so does `Fetch::start`.
//!   Callbacks may therefore issue new requests, even for the same key.
//! - `FetchFactory::build`, `Fetch::has_completed` and `Fetch::cached_result`
//!   run under the lock and must not re-enter the controller. Debug builds
//!   turn such re-entry into a panic (`DebugReentrancy`) rather than a
//!   deadlock.
//! - A completion fired or dropped inside `build` would have to take the
//!   lock `build` runs under. Each completion therefore reports through a
//!   gate that parks its outcome until `request` has inserted the entry. A
//!   factory that completes, drops `done`, or panics inside `build` leaves
//!   the table consistent; a panic propagates to the caller with the table
//!   unchanged.
//!
//! Abandonment
//! - A `Completion` dropped without firing retires its entry: the waiters are
//!   dropped un-invoked (async waiters see `WaitError::Abandoned`) and the key
//!   becomes Absent, so the next request starts over.
//!
//! Notes and non-goals
//! - No result caching beyond the in-flight window, no retries, no
//!   cancellation of individual callers.
//! - Fetch failures are ordinary result values (use `R = Result<T, E>`).
//! - `R: Clone`; every callback gets a clone, the last one the original. Use
//!   `R = Arc<T>` to share one instance.
//! - Callbacks should not panic. A panicking callback unwinds into whoever
//!   fired the completion, and the callbacks registered after it for the same
//!   key are dropped without being called.
//! - A controller dropped while fetches are in flight stays alive until they
//!   complete: each `Completion` holds the shared state.

mod blocking;
mod controller;
mod fetch;
mod key;
mod reentrancy;
#[cfg(feature = "bench_internal")]
pub mod table;
#[cfg(not(feature = "bench_internal"))]
mod table;
mod table_proptest;

// Public surface
pub use blocking::{BlockingFactory, BlockingFetch};
pub use controller::{Controller, Pending, WaitError};
pub use fetch::{Completion, Fetch, FetchFactory};
pub use key::{KeyError, RequestKey};
pub use reentrancy::{DebugReentrancy, Locked};
