//! Per-endpoint rate governor.
//!
//! Every API endpoint path gets its own gate. A gate moves through three
//! states:
//!
//! | state     | meaning                              | `check` behavior            |
//! |-----------|--------------------------------------|-----------------------------|
//! | `Vacant`  | no limit info, nobody fetching it    | caller becomes populator    |
//! | `Pending` | a populator request is in flight     | wait for a transition       |
//! | `Ready`   | limit known (`None` = do not gate)   | admit / block / sleep       |
//!
//! The populator contract: whoever is admitted from `Vacant` (or after the
//! blocking sleep, or on observing an expired window) MUST complete the gate
//! with [`RateGovernor::reset`] on response, or [`RateGovernor::abandon`]
//! when the request never produced one. `abandon` returns the gate to
//! `Vacant` and wakes a single waiter, which inherits the populator duty;
//! `reset` stores the observed limit and wakes everyone. Skipping both
//! deadlocks every waiter on the path — sessions therefore only issue gated
//! requests through a wrapper that resets on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Extra sleep past the advertised window reset, so a slightly skewed server
/// clock does not make the first request after the nap bounce.
const RESET_INSURANCE: Duration = Duration::from_secs(5);

/// Hosts serving static media are not subject to API rate accounting.
const EXEMPT_HOST_SUFFIX: &str = "twimg.com";

/// Errors surfaced by [`RateGovernor::check`]. Neither is a failure of the
/// governor itself: `WouldBlock` tells the caller to try another session,
/// `Cancelled` reports the caller's own shutdown signal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("request would block on the endpoint rate limit")]
    WouldBlock,

    #[error("cancelled while waiting on the endpoint rate limit")]
    Cancelled,
}

/// Whether a gated call may sleep through a depleted window or must return
/// [`GovernorError::WouldBlock`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gating {
    Blocking,
    NonBlocking,
}

/// Rate limit window for one endpoint, as advertised by response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl EndpointLimit {
    /// Parse the `x-rate-limit-*` trio from response headers. Returns `None`
    /// when any of the three is missing or malformed, which the governor
    /// stores as an inert "do not gate" entry.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let field = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
        };
        let limit = field("x-rate-limit-limit")?;
        let remaining = field("x-rate-limit-remaining")?;
        let reset_epoch = field("x-rate-limit-reset")?;
        Some(Self {
            limit: limit.max(0) as u32,
            remaining: remaining.max(0) as u32,
            reset_at: Utc.timestamp_opt(reset_epoch, 0).single()?,
        })
    }

    /// A window blocks once fewer than 2% of its budget (at least one
    /// request) remains and the reset is still in the future.
    fn would_block(&self, now: DateTime<Utc>) -> bool {
        let threshold = (self.limit * 2 / 100).max(1);
        self.remaining <= threshold && now < self.reset_at
    }
}

enum Slot {
    Vacant,
    Pending,
    Ready(Option<EndpointLimit>),
}

struct Gate {
    slot: Mutex<Slot>,
    wake: Notify,
}

/// What `check` decided under the gate lock; awaited outside of it.
enum Admission {
    Proceed,
    WouldBlock,
    Wait,
    SleepUntil(DateTime<Utc>),
}

/// Rate-limit state machine for all endpoint paths seen by one session.
///
/// Owned by the session and injected wherever gating decisions are needed;
/// holds no process-global state.
pub struct RateGovernor {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn is_exempt(url: &Url) -> bool {
        url.host_str()
            .is_some_and(|h| h.ends_with(EXEMPT_HOST_SUFFIX))
    }

    fn gate(&self, path: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock().expect("governor map poisoned");
        gates
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(Gate {
                    slot: Mutex::new(Slot::Vacant),
                    wake: Notify::new(),
                })
            })
            .clone()
    }

    /// Gate an outbound request to `url`.
    ///
    /// Returns `Ok` when the request may be issued. The caller then owes the
    /// gate a [`reset`](Self::reset) or [`abandon`](Self::abandon) whenever
    /// it was admitted as populator; calling them unconditionally after every
    /// admitted request is harmless and is what [`crate::session::Session`]
    /// does.
    pub async fn check(
        &self,
        url: &Url,
        gating: Gating,
        cancel: &CancellationToken,
    ) -> Result<(), GovernorError> {
        if Self::is_exempt(url) {
            return Ok(());
        }
        let gate = self.gate(url.path());

        loop {
            // Register for wakeups before inspecting the slot, so a reset
            // between unlock and await cannot be missed.
            let notified = gate.wake.notified();

            let admission = {
                let mut slot = gate.slot.lock().expect("gate poisoned");
                let now = Utc::now();
                match &mut *slot {
                    Slot::Vacant => {
                        *slot = Slot::Pending;
                        Admission::Proceed
                    }
                    Slot::Pending => Admission::Wait,
                    Slot::Ready(None) => Admission::Proceed,
                    Slot::Ready(Some(limit)) => {
                        if now >= limit.reset_at {
                            // Window expired while gated: this caller refreshes it.
                            *slot = Slot::Pending;
                            Admission::Proceed
                        } else if !limit.would_block(now) {
                            limit.remaining = limit.remaining.saturating_sub(1);
                            Admission::Proceed
                        } else if gating == Gating::NonBlocking {
                            Admission::WouldBlock
                        } else {
                            Admission::SleepUntil(limit.reset_at)
                        }
                    }
                }
            };

            match admission {
                Admission::Proceed => return Ok(()),
                Admission::WouldBlock => return Err(GovernorError::WouldBlock),
                Admission::Wait => {
                    tokio::select! {
                        _ = notified => {}
                        _ = cancel.cancelled() => return Err(GovernorError::Cancelled),
                    }
                }
                Admission::SleepUntil(reset_at) => {
                    let until = (reset_at - Utc::now())
                        .to_std()
                        .unwrap_or_default()
                        + RESET_INSURANCE;
                    tracing::warn!(
                        path = url.path(),
                        secs = until.as_secs(),
                        "rate limit depleted, sleeping until window reset"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(until) => {}
                        _ = cancel.cancelled() => return Err(GovernorError::Cancelled),
                    }
                    // Re-inspect: the first sleeper to come back sees the
                    // expired window and becomes populator, later ones wait.
                }
            }
        }
    }

    /// Complete a gated request with an observed response. `None` (the
    /// `x-rate-limit-*` headers were absent) marks the path inert. Wakes all
    /// waiters.
    pub fn reset(&self, url: &Url, observed: Option<EndpointLimit>) {
        if Self::is_exempt(url) {
            return;
        }
        let Some(gate) = self.lookup(url.path()) else {
            return; // reset without a prior check
        };
        let mut slot = gate.slot.lock().expect("gate poisoned");
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(observed);
            gate.wake.notify_waiters();
        }
    }

    /// Complete a gated request that never produced a response. The gate
    /// returns to `Vacant` and a single waiter is woken to inherit the
    /// populator duty.
    pub fn abandon(&self, url: &Url) {
        if Self::is_exempt(url) {
            return;
        }
        let Some(gate) = self.lookup(url.path()) else {
            return;
        };
        let mut slot = gate.slot.lock().expect("gate poisoned");
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Vacant;
            gate.wake.notify_one();
        }
    }

    /// Non-suspending peek used by session selection: would a request to
    /// `path` currently block? Unseen, pending, and inert paths report
    /// `false`.
    pub fn would_block(&self, path: &str) -> bool {
        let Some(gate) = self.lookup(path) else {
            return false;
        };
        let slot = gate.slot.lock().expect("gate poisoned");
        match &*slot {
            Slot::Ready(Some(limit)) => limit.would_block(Utc::now()),
            _ => false,
        }
    }

    fn lookup(&self, path: &str) -> Option<Arc<Gate>> {
        self.gates
            .lock()
            .expect("governor map poisoned")
            .get(path)
            .cloned()
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}
