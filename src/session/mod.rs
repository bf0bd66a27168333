//! Authenticated sessions.
//!
//! A session is one cookie-authenticated identity plus the rate governor
//! gating its requests. All endpoint calls go through [`Session::get_json`]
//! or [`Session::post_form`], which pair every admitted request with a
//! governor `reset`/`abandon` on every exit path — the populator contract
//! the governor requires can therefore not be forgotten by callers.

pub mod pool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{self, FetchError};
use crate::ratelimit::{EndpointLimit, Gating, RateGovernor};

pub use pool::SessionPool;

/// Cookie pair identifying one account.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub auth_token: String,
    pub csrf_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_token", &"<redacted>")
            .field("csrf_token", &"<redacted>")
            .finish()
    }
}

/// Per-endpoint request counts, shared across the whole pool.
#[derive(Default)]
pub struct ApiCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl ApiCounters {
    pub fn record(&self, path: &str) {
        let mut counts = self.counts.lock().expect("counter map poisoned");
        *counts.entry(path.to_string()).or_insert(0) += 1;
    }

    /// Log per-endpoint call counts, for the end-of-run debug report.
    pub fn report(&self) {
        let counts = self.counts.lock().expect("counter map poisoned");
        let mut entries: Vec<_> = counts.iter().collect();
        entries.sort();
        for (path, count) in entries {
            tracing::debug!(path, count, "endpoint call count");
        }
    }
}

/// One authenticated identity. Unavailable once `last_error` is set; never
/// recovers within a run.
pub struct Session {
    screen_name: String,
    http: reqwest::Client,
    governor: RateGovernor,
    last_error: Mutex<Option<String>>,
    counters: Arc<ApiCounters>,
}

impl Session {
    /// Authenticate a cookie pair. Resolving the account's screen name is
    /// the authentication check: it only succeeds with working cookies.
    pub async fn login(creds: &Credentials, counters: Arc<ApiCounters>) -> anyhow::Result<Self> {
        let screen_name = api::self_screen_name(creds).await?;
        let http = build_api_client(creds)?;
        Ok(Self {
            screen_name,
            http,
            governor: RateGovernor::new(),
            last_error: Mutex::new(None),
            counters,
        })
    }

    pub fn screen_name(&self) -> &str {
        &self.screen_name
    }

    pub fn is_available(&self) -> bool {
        self.last_error.lock().expect("session state poisoned").is_none()
    }

    /// Permanently disable this session. Returns true on the first
    /// transition so the caller can log it exactly once.
    pub fn mark_unavailable(&self, reason: &str) -> bool {
        let mut slot = self.last_error.lock().expect("session state poisoned");
        if slot.is_none() {
            *slot = Some(reason.to_string());
            true
        } else {
            false
        }
    }

    /// Cheap peek: would a request to `path` currently block on this
    /// session's rate budget?
    pub fn would_block(&self, path: &str) -> bool {
        self.governor.would_block(path)
    }

    pub async fn get_json(
        &self,
        url: Url,
        gating: Gating,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let req = self.http.get(url.clone());
        self.request_json(req, url, gating, cancel).await
    }

    pub async fn post_form(
        &self,
        url: Url,
        form: &[(&str, &str)],
        gating: Gating,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let req = self.http.post(url.clone()).form(form);
        self.request_json(req, url, gating, cancel).await
    }

    async fn request_json(
        &self,
        req: reqwest::RequestBuilder,
        url: Url,
        gating: Gating,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        self.governor.check(&url, gating, cancel).await?;
        self.counters.record(url.path());

        let resp = match req.send().await {
            Ok(resp) => {
                // Ready or inert, depending on whether the headers carried
                // rate information; either way all waiters wake.
                self.governor
                    .reset(&url, EndpointLimit::from_headers(resp.headers()));
                resp
            }
            Err(e) => {
                // Never reached the network: return the gate to vacant so a
                // waiter inherits the populator duty.
                self.governor.abandon(&url);
                return Err(e.into());
            }
        };

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(FetchError::Http)?;
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            Err(e) => return Err(FetchError::Parse(e.to_string())),
        };
        // Body-level error codes take precedence over the HTTP status; they
        // carry the session-fatal classification.
        if let Some(api_err) = api::api_error_in(&value) {
            return Err(FetchError::Api(api_err));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(value)
    }

    /// Offline session for tests: no login, plain client, fresh governor.
    #[cfg(test)]
    pub(crate) fn stub(screen_name: &str) -> Self {
        Self {
            screen_name: screen_name.to_string(),
            http: reqwest::Client::new(),
            governor: RateGovernor::new(),
            last_error: Mutex::new(None),
            counters: Arc::new(ApiCounters::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn governor(&self) -> &RateGovernor {
        &self.governor
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("screen_name", &self.screen_name)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

fn build_api_client(creds: &Credentials) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", api::BEARER))?,
    );
    let mut cookie = HeaderValue::from_str(&format!(
        "auth_token={}; ct0={}",
        creds.auth_token, creds.csrf_token
    ))?;
    cookie.set_sensitive(true);
    headers.insert(COOKIE, cookie);
    headers.insert("x-csrf-token", HeaderValue::from_str(&creds.csrf_token)?);

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(5))
        .build()?)
}
