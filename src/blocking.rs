//! Stock fetch: runs a blocking lookup on its own thread.

use crate::fetch::{Completion, Fetch, FetchFactory};
use crate::key::RequestKey;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Factory for [`BlockingFetch`]es sharing one lookup function.
pub struct BlockingFactory<L> {
    lookup: Arc<L>,
}

impl<L> BlockingFactory<L> {
    pub fn new(lookup: L) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl<L> Clone for BlockingFactory<L> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
        }
    }
}

impl<R, L> FetchFactory<R> for BlockingFactory<L>
where
    L: Fn(&RequestKey) -> R + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    type Fetch = BlockingFetch<R>;

    fn build(&self, key: &RequestKey, done: Completion<R>) -> BlockingFetch<R> {
        let lookup = Arc::clone(&self.lookup);
        BlockingFetch::new(key.clone(), move |key: &RequestKey| lookup(key), done)
    }
}

type Job<R> = Box<dyn FnOnce(&RequestKey) -> R + Send + 'static>;

/// A fetch whose lookup runs on a dedicated thread once started.
///
/// The result is cached before the completion fires.
pub struct BlockingFetch<R> {
    key: RequestKey,
    pending: Mutex<Option<(Job<R>, Completion<R>)>>,
    result: Arc<OnceLock<R>>,
}

impl<R> BlockingFetch<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new<J>(key: RequestKey, job: J, done: Completion<R>) -> Self
    where
        J: FnOnce(&RequestKey) -> R + Send + 'static,
    {
        Self {
            key,
            pending: Mutex::new(Some((Box::new(job), done))),
            result: Arc::new(OnceLock::new()),
        }
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }
}

impl<R> Fetch<R> for BlockingFetch<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn start(&self) {
        let Some((job, done)) = self.pending.lock().take() else {
            debug!(key = %self.key, "fetch already started");
            return;
        };
        let key = self.key.clone();
        let result = Arc::clone(&self.result);
        let spawned = std::thread::Builder::new()
            .name(format!("fetch {}", self.key))
            .spawn(move || {
                let value = job(&key);
                // Cache first: a caller attaching now must see the result.
                let _ = result.set(value.clone());
                done.complete(value);
            });
        // On failure the closure, and the completion inside it, is dropped,
        // which reports the fetch as abandoned.
        if let Err(e) = spawned {
            warn!(key = %self.key, error = %e, "failed to spawn fetch thread");
        }
    }

    fn has_completed(&self) -> bool {
        self.result.get().is_some()
    }

    fn cached_result(&self) -> Option<R> {
        self.result.get().cloned()
    }
}
