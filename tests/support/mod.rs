// Test doubles shared by the integration tests.
#![allow(dead_code)]

use inflight_coalesce::{Completion, Fetch, RequestKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fetch completed by hand. `cache` makes it report completion without
/// firing, reproducing the window between a fetch finishing and its
/// completion reaching the controller.
pub struct ManualFetch<R> {
    key: RequestKey,
    done: Mutex<Option<Completion<R>>>,
    cached: Mutex<Option<R>>,
    starts: AtomicUsize,
}

impl<R: Clone> ManualFetch<R> {
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn cache(&self, result: R) {
        *self.cached.lock().unwrap() = Some(result);
    }

    /// Cache `result` and fire the completion.
    pub fn fire(&self, result: R) {
        self.cache(result.clone());
        let done = self.done.lock().unwrap().take().expect("completion fired twice");
        done.complete(result);
    }

    /// Fire with whatever was cached earlier.
    pub fn fire_cached(&self) {
        let result = self.cached.lock().unwrap().clone().expect("nothing cached");
        self.fire(result);
    }

    /// Drop the completion without a result.
    pub fn abandon(&self) {
        drop(self.done.lock().unwrap().take());
    }
}

impl<R: Clone + Send> Fetch<R> for ManualFetch<R> {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn has_completed(&self) -> bool {
        self.cached.lock().unwrap().is_some()
    }

    fn cached_result(&self) -> Option<R> {
        self.cached.lock().unwrap().clone()
    }
}

/// Factory for `ManualFetch`es that counts how many it built.
#[derive(Default)]
pub struct ManualFactory {
    built: AtomicUsize,
}

impl ManualFactory {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

impl<R: Clone + Send + 'static> inflight_coalesce::FetchFactory<R> for ManualFactory {
    type Fetch = ManualFetch<R>;

    fn build(&self, key: &RequestKey, done: Completion<R>) -> ManualFetch<R> {
        self.built.fetch_add(1, Ordering::SeqCst);
        ManualFetch {
            key: key.clone(),
            done: Mutex::new(Some(done)),
            cached: Mutex::new(None),
            starts: AtomicUsize::new(0),
        }
    }
}

/// Records `(tag, result)` pairs in delivery order.
#[derive(Clone)]
pub struct Recorder<R> {
    log: Arc<Mutex<Vec<(String, R)>>>,
}

impl<R: Clone + Send + 'static> Recorder<R> {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self, tag: impl Into<String>) -> impl FnOnce(R) + Send + 'static {
        let log = Arc::clone(&self.log);
        let tag = tag.into();
        move |result| log.lock().unwrap().push((tag, result))
    }

    pub fn entries(&self) -> Vec<(String, R)> {
        self.log.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

pub fn key(ids: &[&str]) -> RequestKey {
    RequestKey::new(ids.iter().copied()).expect("non-empty key")
}
