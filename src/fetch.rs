//! Fetch capability: the collaborator that performs the actual lookup.
//!
//! The controller never looks inside a fetch. It builds one per key through a
//! [`FetchFactory`], starts it once, and waits for the [`Completion`] it
//! handed over at build time to fire.

use crate::key::RequestKey;
use std::fmt;
use tracing::warn;

/// One outstanding lookup.
///
/// A fetch must cache its result *before* firing its completion, so that
/// `has_completed()` and `cached_result()` already report it while the
/// completion is on its way to the controller.
pub trait Fetch<R>: Send + Sync {
    /// Begin the lookup. Called at most once per fetch.
    fn start(&self);

    fn has_completed(&self) -> bool;

    /// The result, present iff `has_completed()` is true.
    fn cached_result(&self) -> Option<R>;
}

/// Builds fetches for the controller.
///
/// `build` runs while the controller's table is locked and must not call back
/// into the controller. Completing or dropping `done` before `build` returns,
/// or panicking, is tolerated: the outcome is held back until the entry
/// exists, then settled without starting the fetch.
pub trait FetchFactory<R>: Send + Sync {
    type Fetch: Fetch<R> + 'static;

    fn build(&self, key: &RequestKey, done: Completion<R>) -> Self::Fetch;
}

impl<R, T, G> FetchFactory<R> for G
where
    G: Fn(&RequestKey, Completion<R>) -> T + Send + Sync,
    T: Fetch<R> + 'static,
{
    type Fetch = T;

    fn build(&self, key: &RequestKey, done: Completion<R>) -> T {
        self(key, done)
    }
}

type Notify<R> = Box<dyn FnOnce(Option<R>) + Send + 'static>;

/// Single-use completion handle given to each fetch.
///
/// `complete` consumes it, so a fetch can report at most once. Dropping it
/// without completing marks the fetch as abandoned: the controller logs a
/// warning and releases the key's waiters instead of leaving them pending
/// forever.
pub struct Completion<R> {
    key: RequestKey,
    notify: Option<Notify<R>>,
}

impl<R> Completion<R> {
    pub(crate) fn with_notify(key: RequestKey, notify: Notify<R>) -> Self {
        Self {
            key,
            notify: Some(notify),
        }
    }

    /// A completion that reports straight to `on_done`, for driving a fetch
    /// outside of a controller.
    pub fn from_fn<C>(key: RequestKey, on_done: C) -> Self
    where
        C: FnOnce(R) + Send + 'static,
    {
        Self::with_notify(
            key,
            Box::new(move |result: Option<R>| {
                if let Some(result) = result {
                    on_done(result);
                }
            }),
        )
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn complete(mut self, result: R) {
        if let Some(notify) = self.notify.take() {
            notify(Some(result));
        }
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            warn!(key = %self.key, "completion dropped without a result");
            notify(None);
        }
    }
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("key", &self.key)
            .field("pending", &self.notify.is_some())
            .finish()
    }
}
