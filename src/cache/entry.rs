//! Mutable state behind one cache entry.
//!
//! Guarded by a plain `std::sync::Mutex` rather than `tokio::sync::Mutex`
//! so that a subscriber callback invoked synchronously from inside the
//! cache (see `Cache::on_fetch_complete`) can call back into the cache —
//! e.g. to unsubscribe itself — without needing to be `async`.

use crate::cache::CacheMode;
use crate::http::AbortHandle;
use crate::request::{Fingerprint, Request};
use crate::response::GraphQlResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub(crate) type SubscriberCallback = Arc<dyn Fn(Option<GraphQlResult>) + Send + Sync>;

pub(crate) struct Subscriber {
    pub id: u64,
    pub callback: SubscriberCallback,
}

pub(crate) struct CacheEntryInner {
    pub fingerprint: Fingerprint,
    pub request: Request,
    pub mode: CacheMode,
    pub ttl: Duration,
    pub result: Option<GraphQlResult>,
    pub loading: bool,
    pub cancel: Option<AbortHandle>,
    pub subscribers: Vec<Subscriber>,
    pub next_subscriber_id: u64,
    pub size: usize,
    pub expires_at: Option<Instant>,
    pub last_used: Instant,
    /// Bumped every time a new fetch starts; a completing fetch whose
    /// generation no longer matches was superseded by a force-refresh and
    /// its result is discarded.
    pub generation: u64,
    /// Notified whenever `result`/`loading` changes, so `result_promise()`
    /// can wait without polling.
    pub completion: Arc<Notify>,
}

impl CacheEntryInner {
    pub fn new(fingerprint: Fingerprint, request: Request, mode: CacheMode, ttl: Duration) -> Self {
        CacheEntryInner {
            fingerprint,
            request,
            mode,
            ttl,
            result: None,
            loading: false,
            cancel: None,
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            size: 0,
            expires_at: None,
            last_used: Instant::now(),
            generation: 0,
            completion: Arc::new(Notify::new()),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Copy the subscriber list before dispatch, so a callback may
    /// unsubscribe itself without mutating the list being iterated.
    pub fn snapshot_subscribers(&self) -> Vec<Subscriber> {
        self.subscribers
            .iter()
            .map(|s| Subscriber {
                id: s.id,
                callback: s.callback.clone(),
            })
            .collect()
    }
}
