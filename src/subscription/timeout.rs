//! Per-connection liveness monitors.
//!
//! A [`TimeoutStrategy`] is a factory; each Connection gets its own
//! [`TimeoutHandler`] instance from it. Handlers never touch the socket
//! directly — only through the injected [`TimeoutApi`], mirroring the
//! "Engine owns the socket" ownership rule. Timers are cancellation-safe:
//! every handler holds its own [`CancelToken`](crate::cancel::CancelToken)
//! ("lifetime") and every spawned timer races it, so `on_close` leaves no
//! timer scheduled.
//!
//! `IdleTimeout` and `CorrelatedPingTimeout` are flyweight-cached by
//! parameter tuple via `std::sync::LazyLock`, the same pattern used for
//! a global connection pool.

use crate::cancel::CancelToken;
use crate::codec::Message;
use crate::subscription::CloseReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// The capability a [`TimeoutHandler`] is given to act on its
/// Connection, without being handed the socket itself.
pub trait TimeoutApi: Send + Sync {
    fn send(&self, message: Message);
    fn abort(&self, reason: CloseReason);
}

/// Per-connection instance produced by a [`TimeoutStrategy`].
///
/// Hooks are invoked by the Engine at the points named. `on_inbound`
/// returning `true` means "consumed" — the Engine skips its own default
/// handling of that frame (e.g. the ping/pong default reply).
pub trait TimeoutHandler: Send + Sync {
    fn on_open(&self, api: Arc<dyn TimeoutApi>);
    fn on_ack(&self, api: Arc<dyn TimeoutApi>);
    fn on_inbound(&self, message: &Message, api: Arc<dyn TimeoutApi>) -> bool;
    fn on_outbound(&self, message: &Message, api: Arc<dyn TimeoutApi>);
    fn on_close(&self, reason: CloseReason);
}

pub trait TimeoutStrategy: Send + Sync {
    fn create_handler(&self) -> Arc<dyn TimeoutHandler>;
}

// ---------------------------------------------------------------------
// Idle timeout
// ---------------------------------------------------------------------

/// Arms a single deadline of `idle_ms`; any open/ack/inbound activity
/// re-arms it. Expiry calls `abort(Timeout)`.
pub struct IdleTimeout {
    idle_ms: u64,
}

static IDLE_CACHE: LazyLock<Mutex<HashMap<u64, Arc<IdleTimeout>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl IdleTimeout {
    /// Flyweight-cached by `idle_ms`: repeated calls with the same value
    /// return the same instance.
    pub fn new(idle_ms: u64) -> Arc<IdleTimeout> {
        IDLE_CACHE
            .lock()
            .unwrap()
            .entry(idle_ms)
            .or_insert_with(|| Arc::new(IdleTimeout { idle_ms }))
            .clone()
    }

    #[doc(hidden)]
    pub fn clear_for_test() {
        IDLE_CACHE.lock().unwrap().clear();
    }
}

impl TimeoutStrategy for IdleTimeout {
    fn create_handler(&self) -> Arc<dyn TimeoutHandler> {
        Arc::new(IdleTimeoutHandler {
            idle_ms: self.idle_ms,
            generation: Arc::new(AtomicU64::new(0)),
            lifetime: CancelToken::new(),
        })
    }
}

struct IdleTimeoutHandler {
    idle_ms: u64,
    generation: Arc<AtomicU64>,
    lifetime: CancelToken,
}

impl IdleTimeoutHandler {
    fn rearm(&self, api: Arc<dyn TimeoutApi>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Duration::from_millis(self.idle_ms);
        let generation_counter = self.generation.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                _ = sleep(deadline) => {
                    if generation_counter.load(Ordering::SeqCst) == generation {
                        api.abort(CloseReason::Timeout);
                    }
                }
            }
        });
    }
}

impl TimeoutHandler for IdleTimeoutHandler {
    fn on_open(&self, api: Arc<dyn TimeoutApi>) {
        self.rearm(api);
    }

    fn on_ack(&self, api: Arc<dyn TimeoutApi>) {
        self.rearm(api);
    }

    fn on_inbound(&self, _message: &Message, api: Arc<dyn TimeoutApi>) -> bool {
        self.rearm(api);
        false
    }

    fn on_outbound(&self, _message: &Message, _api: Arc<dyn TimeoutApi>) {}

    fn on_close(&self, _reason: CloseReason) {
        self.lifetime.cancel();
    }
}

// ---------------------------------------------------------------------
// Correlated ping/pong timeout
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PingParams {
    ack_timeout_ms: u64,
    ping_interval_ms: u64,
    pong_deadline_ms: u64,
}

pub struct CorrelatedPingTimeout {
    params: PingParams,
}

static PING_CACHE: LazyLock<Mutex<HashMap<PingParams, Arc<CorrelatedPingTimeout>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl CorrelatedPingTimeout {
    /// Flyweight-cached by the `(ack_timeout_ms, ping_interval_ms,
    /// pong_deadline_ms)` tuple.
    pub fn new(ack_timeout_ms: u64, ping_interval_ms: u64, pong_deadline_ms: u64) -> Arc<CorrelatedPingTimeout> {
        let params = PingParams {
            ack_timeout_ms,
            ping_interval_ms,
            pong_deadline_ms,
        };
        PING_CACHE
            .lock()
            .unwrap()
            .entry(params)
            .or_insert_with(|| Arc::new(CorrelatedPingTimeout { params }))
            .clone()
    }

    #[doc(hidden)]
    pub fn clear_for_test() {
        PING_CACHE.lock().unwrap().clear();
    }
}

impl TimeoutStrategy for CorrelatedPingTimeout {
    fn create_handler(&self) -> Arc<dyn TimeoutHandler> {
        Arc::new(CorrelatedPingTimeoutHandler {
            params: self.params,
            inner: Arc::new(Mutex::new(PingInner {
                generation: 0,
                acked: false,
                in_flight_ping: None,
            })),
            lifetime: CancelToken::new(),
        })
    }
}

struct PingInner {
    generation: u64,
    acked: bool,
    in_flight_ping: Option<String>,
}

struct CorrelatedPingTimeoutHandler {
    params: PingParams,
    inner: Arc<Mutex<PingInner>>,
    lifetime: CancelToken,
}

impl TimeoutHandler for CorrelatedPingTimeoutHandler {
    fn on_open(&self, api: Arc<dyn TimeoutApi>) {
        let generation = {
            let mut guard = self.inner.lock().unwrap();
            guard.generation += 1;
            guard.acked = false;
            guard.generation
        };
        let deadline = Duration::from_millis(self.params.ack_timeout_ms);
        let inner = self.inner.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                _ = sleep(deadline) => {
                    let fire = {
                        let guard = inner.lock().unwrap();
                        guard.generation == generation && !guard.acked
                    };
                    if fire {
                        api.abort(CloseReason::Timeout);
                    }
                }
            }
        });
    }

    fn on_ack(&self, api: Arc<dyn TimeoutApi>) {
        let generation = {
            let mut guard = self.inner.lock().unwrap();
            guard.acked = true;
            guard.generation += 1;
            guard.generation
        };
        let period = Duration::from_millis(self.params.ping_interval_ms);
        let pong_deadline_ms = self.params.pong_deadline_ms;
        let inner = self.inner.clone();
        let lifetime = self.lifetime.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick is immediate; the first real period starts here
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => return,
                    _ = interval.tick() => {
                        let (still_current, already_in_flight) = {
                            let guard = inner.lock().unwrap();
                            (guard.generation == generation, guard.in_flight_ping.is_some())
                        };
                        if !still_current {
                            return;
                        }
                        if already_in_flight {
                            continue;
                        }

                        let ping_id = uuid::Uuid::new_v4().to_string();
                        inner.lock().unwrap().in_flight_ping = Some(ping_id.clone());
                        api.send(Message::Ping {
                            payload: Some(serde_json::json!({ "id": ping_id })),
                        });

                        let pong_deadline = Duration::from_millis(pong_deadline_ms);
                        let inner_for_deadline = inner.clone();
                        let api_for_deadline = api.clone();
                        let lifetime_for_deadline = lifetime.clone();
                        let expected_id = ping_id;
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = lifetime_for_deadline.cancelled() => {}
                                _ = sleep(pong_deadline) => {
                                    let fire = {
                                        let guard = inner_for_deadline.lock().unwrap();
                                        guard.generation == generation
                                            && guard.in_flight_ping.as_deref() == Some(expected_id.as_str())
                                    };
                                    if fire {
                                        api_for_deadline.abort(CloseReason::Timeout);
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });
    }

    fn on_inbound(&self, message: &Message, _api: Arc<dyn TimeoutApi>) -> bool {
        let Message::Pong { payload } = message else {
            return false;
        };
        let Some(id) = payload.as_ref().and_then(|p| p.get("id")).and_then(|v| v.as_str()) else {
            return false;
        };

        let mut guard = self.inner.lock().unwrap();
        if guard.in_flight_ping.as_deref() == Some(id) {
            guard.in_flight_ping = None;
            true
        } else {
            false
        }
    }

    fn on_outbound(&self, _message: &Message, _api: Arc<dyn TimeoutApi>) {}

    fn on_close(&self, _reason: CloseReason) {
        self.lifetime.cancel();
    }
}
