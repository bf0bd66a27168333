//! Session pool and selection.
//!
//! Selection is greedy and non-blocking-first: any session that can serve
//! the endpoint right now beats waiting for a preferred one, because fetch
//! progress matters more than session affinity. The pool only waits when
//! every healthy session is rate limited for the path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ApiCounters, Session};

/// How long to sleep between scans when all healthy sessions are limited.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Owns every authenticated session for the run. The first session is the
/// master: the account whose follows grant visibility into protected
/// targets.
pub struct SessionPool {
    sessions: Vec<Arc<Session>>,
    counters: Arc<ApiCounters>,
}

impl SessionPool {
    pub fn new(master: Session, counters: Arc<ApiCounters>) -> Self {
        Self {
            sessions: vec![Arc::new(master)],
            counters,
        }
    }

    /// Register an additional session. Identities must be unique — the same
    /// account cookie added twice would double-spend one rate budget while
    /// the governor accounts for two.
    pub fn add(&mut self, session: Session) -> anyhow::Result<()> {
        if self
            .sessions
            .iter()
            .any(|s| s.screen_name() == session.screen_name())
        {
            anyhow::bail!("session {} is already in the pool", session.screen_name());
        }
        self.sessions.push(Arc::new(session));
        Ok(())
    }

    pub fn master(&self) -> Arc<Session> {
        self.sessions[0].clone()
    }

    /// The master session, if it is healthy and would not block for `path`.
    /// Used preferentially for targets only the master can see.
    pub fn master_if_ready(&self, path: &str) -> Option<Arc<Session>> {
        let master = &self.sessions[0];
        (master.is_available() && !master.would_block(path)).then(|| master.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Retained for API completeness with `len`; the pool always holds at
    /// least the master session.
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Pick a session that can serve `path` without blocking.
    ///
    /// Returns `None` immediately when every session has failed (nothing to
    /// wait for), or when cancelled. Otherwise polls until some session's
    /// window frees up.
    pub async fn select(&self, path: &str, cancel: &CancellationToken) -> Option<Arc<Session>> {
        let mut announced = false;
        while !cancel.is_cancelled() {
            let mut errored = 0;
            for session in &self.sessions {
                if !session.is_available() {
                    errored += 1;
                    continue;
                }
                if !session.would_block(path) {
                    return Some(session.clone());
                }
            }
            if errored == self.sessions.len() {
                return None;
            }

            if !announced {
                tracing::warn!(path, "all sessions rate limited, waiting for a window reset");
                announced = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return None,
            }
        }
        None
    }

    /// Permanently disable a session for the remainder of the run.
    pub fn mark_unavailable(&self, session: &Session, reason: &str) {
        if session.mark_unavailable(reason) {
            tracing::warn!(
                session = session.screen_name(),
                reason,
                "session is no longer available"
            );
        }
    }

    pub fn report_api_counts(&self) {
        self.counters.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{EndpointLimit, Gating};
    use chrono::{Duration as ChronoDuration, Utc};
    use reqwest::Url;

    const PATH: &str = "/i/api/graphql/abc/UserMedia";

    fn pool_of(names: &[&str]) -> SessionPool {
        let counters = Arc::new(ApiCounters::default());
        let mut names = names.iter();
        let mut pool = SessionPool::new(Session::stub(names.next().unwrap()), counters.clone());
        for name in names {
            pool.add(Session::stub(name)).unwrap();
        }
        pool
    }

    /// Drive a session's governor into a depleted, ready window for PATH.
    async fn exhaust(session: &Session) {
        let url = Url::parse(&format!("https://x.com{PATH}")).unwrap();
        let cancel = CancellationToken::new();
        session
            .governor()
            .check(&url, Gating::NonBlocking, &cancel)
            .await
            .unwrap();
        session.governor().reset(
            &url,
            Some(EndpointLimit {
                limit: 100,
                remaining: 1,
                reset_at: Utc::now() + ChronoDuration::seconds(60),
            }),
        );
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut pool = pool_of(&["master"]);
        assert!(pool.add(Session::stub("master")).is_err());
        assert!(pool.add(Session::stub("second")).is_ok());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn select_returns_first_unblocked_session() {
        let pool = pool_of(&["master", "second"]);
        let cancel = CancellationToken::new();
        let chosen = pool.select(PATH, &cancel).await.unwrap();
        assert_eq!(chosen.screen_name(), "master");
    }

    #[tokio::test]
    async fn select_skips_rate_limited_sessions() {
        let pool = pool_of(&["master", "second"]);
        exhaust(&pool.master()).await;
        let cancel = CancellationToken::new();
        let chosen = pool.select(PATH, &cancel).await.unwrap();
        assert_eq!(chosen.screen_name(), "second");
    }

    #[tokio::test]
    async fn select_skips_failed_sessions() {
        let pool = pool_of(&["master", "second"]);
        pool.master().mark_unavailable("account is locked");
        let cancel = CancellationToken::new();
        let chosen = pool.select(PATH, &cancel).await.unwrap();
        assert_eq!(chosen.screen_name(), "second");
    }

    #[tokio::test]
    async fn select_returns_none_when_every_session_failed() {
        let pool = pool_of(&["master", "second"]);
        pool.mark_unavailable(&pool.master(), "locked");
        pool.mark_unavailable(&pool.select(PATH, &CancellationToken::new()).await.unwrap(), "locked");
        let cancel = CancellationToken::new();
        assert!(pool.select(PATH, &cancel).await.is_none());
    }

    #[tokio::test]
    async fn select_returns_none_on_cancellation() {
        let pool = pool_of(&["master"]);
        exhaust(&pool.master()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pool.select(PATH, &cancel).await.is_none());
    }

    #[tokio::test]
    async fn master_preference_respects_health_and_budget() {
        let pool = pool_of(&["master", "second"]);
        assert!(pool.master_if_ready(PATH).is_some());
        exhaust(&pool.master()).await;
        assert!(pool.master_if_ready(PATH).is_none());
    }
}
