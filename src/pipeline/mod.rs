//! The fetch/download pipeline.
//!
//! One sequential producer drains the target scheduler: it picks a session,
//! runs the paginated fetch from the target's cursor, and feeds per-post
//! download jobs into a bounded queue. A fixed pool of consumers performs
//! the media transfers. The pipeline's contract is that no work is ever
//! lost: every job that leaves the producer either lands on disk (plus a
//! record-store row) or comes back in the failed list.

pub mod worker;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::api::{self, FetchError, PageSource, Post};
use crate::scheduler::{Scheduler, SyncTarget};
use crate::session::{Session, SessionPool};
use crate::store::{RecordStore, StoreError};

pub use worker::{JobExecutor, MediaDownloader};

/// How long the producer waits for queue capacity before treating the
/// remaining posts of a target as unsent.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(120);

/// Transient-failure budget per target and run. Prevents a permanently
/// broken target from cycling through the heap forever; its durable cursor
/// picks it back up next run.
const MAX_FETCH_ATTEMPTS: u32 = 3;

/// One unit of work: a single post owed to a target.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub target_id: i64,
    pub account_id: u64,
    pub dir: PathBuf,
    pub post: Post,
}

/// Pipeline-fatal conditions. Any of these cancels the whole run; queued
/// and in-flight work drains into the failed list.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no session available")]
    NoSessionAvailable,

    #[error("out of disk space: {0}")]
    DiskFull(String),

    #[error("record store failure: {0}")]
    Store(#[from] StoreError),

    #[error("worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub no_progress_bar: bool,
}

/// Outcome of one pipeline pass.
#[derive(Debug)]
pub struct PipelineReport {
    /// Jobs emitted by the producer.
    pub produced: u64,
    /// Jobs whose media landed on disk with a record row.
    pub downloaded: u64,
    /// Jobs whose media is permanently gone upstream (404/403).
    pub skipped: u64,
    /// Jobs that did not complete; the caller feeds these to the ledger.
    pub failed: Vec<DownloadJob>,
    pub duration: Duration,
    /// Terminal error, when the pass died rather than finished.
    pub error: Option<PipelineError>,
}

impl PipelineReport {
    pub fn log_summary(&self, pass: &str) {
        tracing::info!(
            pass,
            produced = self.produced,
            downloaded = self.downloaded,
            skipped = self.skipped,
            failed = self.failed.len(),
            elapsed = %format_duration(self.duration),
            "pipeline pass finished"
        );
    }
}

/// State shared between the producer, the consumers, and the aggregator:
/// the pass-local cancellation token, the first fatal cause, and counters.
pub(crate) struct PipelineShared {
    cancel: CancellationToken,
    cause: Mutex<Option<PipelineError>>,
    downloaded: AtomicU64,
    skipped: AtomicU64,
}

impl PipelineShared {
    fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cancel,
            cause: Mutex::new(None),
            downloaded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        })
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a pipeline-fatal error (first one wins) and cancel the pass.
    pub(crate) fn fatal(&self, error: PipelineError) {
        {
            let mut cause = self.cause.lock().expect("cause cell poisoned");
            if cause.is_none() {
                tracing::error!(error = %error, "pipeline-fatal error, cancelling the pass");
                *cause = Some(error);
            }
        }
        self.cancel.cancel();
    }

    fn take_cause(&self) -> Option<PipelineError> {
        self.cause.lock().expect("cause cell poisoned").take()
    }
}

/// Run the main pass: drain the scheduler through the producer/consumer
/// engine until it is empty or the pass is cancelled.
pub async fn run(
    mut scheduler: Scheduler,
    pool: &SessionPool,
    source: &dyn PageSource,
    executor: Arc<dyn JobExecutor>,
    store: &dyn RecordStore,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> PipelineReport {
    let started = Instant::now();
    let shared = PipelineShared::new(cancel.child_token());
    let concurrency = config.concurrency.max(1);

    let (tx, rx) = mpsc::channel::<DownloadJob>(concurrency);
    let rx = Arc::new(AsyncMutex::new(rx));
    let pb = progress_bar(config.no_progress_bar, 0);

    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        workers.push(tokio::spawn(worker::consume(
            rx.clone(),
            executor.clone(),
            shared.clone(),
            pb.clone(),
        )));
    }

    let (produced, leftovers) =
        produce(&mut scheduler, pool, source, store, &tx, shared.as_ref(), &pb).await;
    drop(tx); // closes the queue once the consumers drain it

    let mut failed = leftovers;
    for handle in workers {
        match handle.await {
            Ok(mut list) => failed.append(&mut list),
            Err(e) => shared.fatal(PipelineError::Worker(e.to_string())),
        }
    }
    pb.finish_and_clear();

    if !scheduler.is_empty() {
        tracing::debug!(remaining = scheduler.len(), "targets not attempted this pass");
    }

    PipelineReport {
        produced,
        downloaded: shared.downloaded.load(Ordering::SeqCst),
        skipped: shared.skipped.load(Ordering::SeqCst),
        failed,
        duration: started.elapsed(),
        error: shared.take_cause(),
    }
}

/// Run the consumer stage over an already-known job list, bypassing the
/// scheduler. This is the ledger retry path.
pub async fn run_jobs(
    jobs: Vec<DownloadJob>,
    executor: Arc<dyn JobExecutor>,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> PipelineReport {
    let started = Instant::now();
    let shared = PipelineShared::new(cancel.child_token());
    let total = jobs.len();
    let concurrency = config.concurrency.max(1).min(total.max(1));

    // Queue capacity covers the whole batch, so feeding never blocks.
    let (tx, rx) = mpsc::channel::<DownloadJob>(total.max(1));
    for job in jobs {
        if tx.send(job).await.is_err() {
            break; // receiver half cannot close while tx is alive
        }
    }
    drop(tx);

    let rx = Arc::new(AsyncMutex::new(rx));
    let pb = progress_bar(config.no_progress_bar, total as u64);

    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        workers.push(tokio::spawn(worker::consume(
            rx.clone(),
            executor.clone(),
            shared.clone(),
            pb.clone(),
        )));
    }

    let mut failed = Vec::new();
    for handle in workers {
        match handle.await {
            Ok(mut list) => failed.append(&mut list),
            Err(e) => shared.fatal(PipelineError::Worker(e.to_string())),
        }
    }
    pb.finish_and_clear();

    PipelineReport {
        produced: total as u64,
        downloaded: shared.downloaded.load(Ordering::SeqCst),
        skipped: shared.skipped.load(Ordering::SeqCst),
        failed,
        duration: started.elapsed(),
        error: shared.take_cause(),
    }
}

/// The sequential producer: pop a target, fetch its new posts, enqueue
/// them, persist the cursor. Returns the produced count and the jobs that
/// never made it into the queue.
async fn produce(
    scheduler: &mut Scheduler,
    pool: &SessionPool,
    source: &dyn PageSource,
    store: &dyn RecordStore,
    tx: &mpsc::Sender<DownloadJob>,
    shared: &PipelineShared,
    pb: &ProgressBar,
) -> (u64, Vec<DownloadJob>) {
    let mut produced: u64 = 0;
    let mut leftovers = Vec::new();
    let cancel = shared.cancel_token();

    while !cancel.is_cancelled() {
        let Some(mut target) = scheduler.pop() else {
            break;
        };

        let Some(session) = select_session(pool, &target, cancel).await else {
            scheduler.push(target);
            if !cancel.is_cancelled() {
                shared.fatal(PipelineError::NoSessionAvailable);
            }
            break;
        };

        match api::fetch_media_since(
            source,
            &session,
            target.account_id,
            target.cursor,
            cancel,
        )
        .await
        {
            // Expected, non-fatal: this session's window for the endpoint
            // is depleted. The target retries once some session frees up.
            Err(FetchError::WouldBlock) => {
                scheduler.push(target);
                continue;
            }
            Err(FetchError::Cancelled) => {
                scheduler.push(target);
                break;
            }
            Err(FetchError::Api(e)) if e.is_session_fatal() => {
                pool.mark_unavailable(&session, e.session_fault_reason());
                scheduler.push(target);
                continue;
            }
            Err(e) => {
                target.attempts += 1;
                if target.attempts < MAX_FETCH_ATTEMPTS {
                    pb.suspend(|| {
                        tracing::warn!(target = %target.title, error = %e, "fetch failed, requeueing");
                    });
                    scheduler.push(target);
                } else {
                    pb.suspend(|| {
                        tracing::warn!(
                            target = %target.title,
                            error = %e,
                            attempts = target.attempts,
                            "fetch failed repeatedly, giving up for this run"
                        );
                    });
                }
                continue;
            }
            Ok(posts) if posts.is_empty() => {
                // Caught up: record the remote count so the next run
                // schedules a single confirmation fetch.
                if let Err(e) = store
                    .set_target_media_count(target.id, target.remote_count)
                    .await
                {
                    shared.fatal(PipelineError::Store(e));
                    break;
                }
            }
            Ok(posts) => {
                let newest = posts[0].created_at;
                let (sent, unsent) = enqueue_jobs(&target, posts, tx, pb, cancel).await;
                produced += sent;
                // The cursor advances even when the enqueue was cut short:
                // the unsent jobs surface in the failed list, so advancing
                // never skips content.
                if let Err(e) = store
                    .update_target_stats(target.id, newest, target.remote_count)
                    .await
                {
                    leftovers.extend(unsent);
                    shared.fatal(PipelineError::Store(e));
                    break;
                }
                leftovers.extend(unsent);
            }
        }
    }

    (produced, leftovers)
}

/// Pick a session for a target's fetch. Exclusive-visibility targets prefer
/// the master session when it can serve right away.
async fn select_session(
    pool: &SessionPool,
    target: &SyncTarget,
    cancel: &CancellationToken,
) -> Option<Arc<Session>> {
    if target.exclusive {
        if let Some(master) = pool.master_if_ready(api::USER_MEDIA_PATH) {
            return Some(master);
        }
    }
    pool.select(api::USER_MEDIA_PATH, cancel).await
}

/// Enqueue one target's posts in timeline order. Returns the sent count
/// and the jobs that were never accepted by the queue.
async fn enqueue_jobs(
    target: &SyncTarget,
    posts: Vec<Post>,
    tx: &mpsc::Sender<DownloadJob>,
    pb: &ProgressBar,
    cancel: &CancellationToken,
) -> (u64, Vec<DownloadJob>) {
    let job_of = |post: Post| DownloadJob {
        target_id: target.id,
        account_id: target.account_id,
        dir: target.dir.clone(),
        post,
    };

    let mut sent: u64 = 0;
    let mut unsent = Vec::new();
    let mut posts = posts.into_iter();

    for post in posts.by_ref() {
        // After cancellation the workers are draining straight into their
        // failed lists, so sends still complete; jobs the queue will not
        // take become leftovers here either way.
        match tx.send_timeout(job_of(post), ENQUEUE_TIMEOUT).await {
            Ok(()) => {
                sent += 1;
                pb.inc_length(1);
            }
            Err(SendTimeoutError::Timeout(job)) | Err(SendTimeoutError::Closed(job)) => {
                pb.suspend(|| {
                    tracing::warn!(target = %target.title, "download queue stalled, keeping remaining posts as leftovers");
                });
                unsent.push(job);
                break;
            }
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    unsent.extend(posts.map(job_of));

    (sent, unsent)
}

/// Progress bar for the download phase. Hidden when disabled or when
/// stdout is not a TTY. Length 0 means "grows as the producer emits".
fn progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TimelinePage;
    use crate::session::ApiCounters;
    use crate::storage::DownloadError;
    use crate::store::SqliteRecordStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn post(id: u64, secs: i64) -> Post {
        Post {
            id,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            text: format!("post {id}"),
            media_urls: vec![format!("https://pbs.twimg.com/media/{id}.jpg")],
        }
    }

    fn job(target_id: i64, post_id: u64) -> DownloadJob {
        DownloadJob {
            target_id,
            account_id: target_id as u64,
            dir: PathBuf::from("/tmp/xmirror-test"),
            post: post(post_id, post_id as i64),
        }
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            concurrency: 4,
            no_progress_bar: true,
        }
    }

    fn pool_of(names: &[&str]) -> SessionPool {
        let counters = Arc::new(ApiCounters::default());
        let mut names = names.iter();
        let mut pool = SessionPool::new(Session::stub(names.next().unwrap()), counters);
        for name in names {
            pool.add(Session::stub(name)).unwrap();
        }
        pool
    }

    /// Executor whose outcome is scripted per post id.
    struct ScriptedExecutor {
        fail_when: fn(u64) -> bool,
        executed: AtomicUsize,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedExecutor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_when: |_| false,
                executed: AtomicUsize::new(0),
                cancel_after: None,
            })
        }

        fn failing(fail_when: fn(u64) -> bool) -> Arc<Self> {
            Arc::new(Self {
                fail_when,
                executed: AtomicUsize::new(0),
                cancel_after: None,
            })
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(&self, job: &DownloadJob) -> Result<(), DownloadError> {
            let n = self.executed.fetch_add(1, Ordering::SeqCst);
            if let Some((after, token)) = &self.cancel_after {
                if n + 1 >= *after {
                    token.cancel();
                }
            }
            if (self.fail_when)(job.post.id) {
                Err(DownloadError::Status {
                    status: 500,
                    url: "stub".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    /// Page source scripted per session name.
    struct ScriptedSource {
        pages: Mutex<Vec<Vec<Post>>>,
        calls: AtomicUsize,
        fail_for_session: Option<(&'static str, i64)>,
    }

    impl ScriptedSource {
        fn with_pages(pages: Vec<Vec<Post>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
                fail_for_session: None,
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn media_page(
            &self,
            session: &Session,
            _account_id: u64,
            _cursor: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<TimelinePage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((name, code)) = self.fail_for_session {
                if session.screen_name() == name {
                    return Err(FetchError::Api(crate::api::ApiError {
                        code,
                        message: "scripted".into(),
                    }));
                }
            }
            let posts = self.pages.lock().unwrap().pop().unwrap_or_default();
            Ok(TimelinePage {
                posts,
                next_cursor: Some("next".into()),
            })
        }
    }

    async fn seeded_target(
        store: &SqliteRecordStore,
        account_id: u64,
        known: u32,
        remote: u32,
    ) -> SyncTarget {
        let record = store
            .create_target(account_id, &format!("User{account_id}(u{account_id})"))
            .await
            .unwrap();
        SyncTarget {
            id: record.id,
            account_id,
            title: record.folder_name.clone(),
            dir: PathBuf::from("/tmp/xmirror-test").join(&record.folder_name),
            cursor: None,
            known_count: known,
            remote_count: remote,
            exclusive: false,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn run_jobs_accounts_for_every_job() {
        let jobs: Vec<DownloadJob> = (0..40).map(|i| job(1, i)).collect();
        let executor = ScriptedExecutor::failing(|id| id % 3 == 0);
        let report = run_jobs(
            jobs,
            executor,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.produced, 40);
        assert_eq!(report.downloaded + report.failed.len() as u64, 40);
        assert_eq!(report.failed.len(), 14); // ids 0,3,..,39
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn run_jobs_drains_everything_on_cancellation() {
        let jobs: Vec<DownloadJob> = (0..60).map(|i| job(1, i)).collect();
        let cancel = CancellationToken::new();
        let executor = Arc::new(ScriptedExecutor {
            fail_when: |_| false,
            executed: AtomicUsize::new(0),
            cancel_after: Some((10, cancel.clone())),
        });

        let report = run_jobs(jobs, executor, &quick_config(), &cancel).await;
        // Every job is accounted for: downloaded before the cancel, drained
        // into the failed list after it.
        assert_eq!(report.downloaded + report.failed.len() as u64, 60);
        assert!(!report.failed.is_empty());
    }

    #[tokio::test]
    async fn disk_full_cancels_the_whole_pass() {
        let jobs: Vec<DownloadJob> = (0..50).map(|i| job(1, i)).collect();

        struct DiskFullExecutor;
        #[async_trait]
        impl JobExecutor for DiskFullExecutor {
            async fn execute(&self, job: &DownloadJob) -> Result<(), DownloadError> {
                if job.post.id == 3 {
                    Err(DownloadError::Disk(std::io::Error::from_raw_os_error(28)))
                } else {
                    Ok(())
                }
            }
        }

        let report = run_jobs(
            jobs,
            Arc::new(DiskFullExecutor),
            &PipelineConfig {
                concurrency: 2,
                no_progress_bar: true,
            },
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(report.error, Some(PipelineError::DiskFull(_))));
        assert_eq!(report.downloaded + report.failed.len() as u64, 50);
        assert!(!report.failed.is_empty());
    }

    #[tokio::test]
    async fn end_to_end_new_target_scenario() {
        // known=0, remote=150: depth 4 up front, three page fetches
        // (70, 70, then the empty confirmation page).
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let target = seeded_target(&store, 1, 0, 150).await;
        let target_id = target.id;
        assert_eq!(target.depth(), 4);

        let newest = 100_000i64;
        let source = ScriptedSource::with_pages(vec![
            (0..70).map(|i| post(1000 - i, newest - i as i64)).collect(),
            (70..140).map(|i| post(1000 - i, newest - i as i64)).collect(),
            Vec::new(),
        ]);
        let executor = ScriptedExecutor::ok();
        let scheduler = Scheduler::new(vec![target]).unwrap();
        let pool = pool_of(&["master"]);

        let report = run(
            scheduler,
            &pool,
            &source,
            executor,
            &store,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        assert!(report.error.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.produced, 140);
        assert_eq!(report.downloaded, 140);
        assert!(report.failed.is_empty());

        let record = store.get_target(target_id).await.unwrap().unwrap();
        assert_eq!(
            record.latest_post_at,
            Some(Utc.timestamp_opt(newest, 0).unwrap())
        );
        assert_eq!(record.media_count, 150);
    }

    #[tokio::test]
    async fn caught_up_target_updates_count_without_jobs() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut target = seeded_target(&store, 2, 150, 151).await;
        target.cursor = Some(Utc.timestamp_opt(50_000, 0).unwrap());
        let target_id = target.id;

        let source = ScriptedSource::with_pages(vec![Vec::new()]);
        let report = run(
            Scheduler::new(vec![target]).unwrap(),
            &pool_of(&["master"]),
            &source,
            ScriptedExecutor::ok(),
            &store,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.produced, 0);
        assert!(report.error.is_none());
        let record = store.get_target(target_id).await.unwrap().unwrap();
        assert_eq!(record.media_count, 151);
        // The cursor is untouched by a no-gap confirmation.
        assert_eq!(record.latest_post_at, Some(Utc.timestamp_opt(50_000, 0).unwrap()));
    }

    #[tokio::test]
    async fn all_sessions_errored_is_pipeline_fatal() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let target = seeded_target(&store, 3, 0, 70).await;
        let pool = pool_of(&["master"]);
        pool.master().mark_unavailable("account is locked");

        let source = ScriptedSource::with_pages(vec![]);
        let report = run(
            Scheduler::new(vec![target]).unwrap(),
            &pool,
            &source,
            ScriptedExecutor::ok(),
            &store,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(report.error, Some(PipelineError::NoSessionAvailable)));
        assert_eq!(report.produced, 0);
    }

    #[tokio::test]
    async fn session_fatal_code_disables_session_and_reschedules() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let target = seeded_target(&store, 4, 0, 70).await;
        let pool = pool_of(&["master", "backup"]);

        // The master always reports an account lock; the backup serves the
        // pages. The target must end up fetched through the backup.
        let source = ScriptedSource {
            pages: Mutex::new(vec![Vec::new(), (0..10).map(|i| post(i, 1000 + i as i64)).collect()]),
            calls: AtomicUsize::new(0),
            fail_for_session: Some(("master", crate::api::error::CODE_ACCOUNT_LOCKED)),
        };

        let report = run(
            Scheduler::new(vec![target]).unwrap(),
            &pool,
            &source,
            ScriptedExecutor::ok(),
            &store,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        assert!(!pool.master().is_available());
        assert!(report.error.is_none());
        assert_eq!(report.produced, 10);
        assert_eq!(report.downloaded, 10);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_attempt_budget() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let target = seeded_target(&store, 5, 0, 70).await;

        struct AlwaysBroken(AtomicUsize);
        #[async_trait]
        impl PageSource for AlwaysBroken {
            async fn media_page(
                &self,
                _session: &Session,
                _account_id: u64,
                _cursor: Option<&str>,
                _cancel: &CancellationToken,
            ) -> Result<TimelinePage, FetchError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Parse("scripted breakage".into()))
            }
        }

        let source = AlwaysBroken(AtomicUsize::new(0));
        let report = run(
            Scheduler::new(vec![target]).unwrap(),
            &pool_of(&["master"]),
            &source,
            ScriptedExecutor::ok(),
            &store,
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;

        // The run terminates instead of spinning, with no terminal error.
        assert_eq!(source.0.load(Ordering::SeqCst), MAX_FETCH_ATTEMPTS as usize);
        assert!(report.error.is_none());
        assert_eq!(report.produced, 0);
    }

    #[tokio::test]
    async fn skippable_media_is_neither_downloaded_nor_failed() {
        let jobs: Vec<DownloadJob> = (0..10).map(|i| job(1, i)).collect();

        struct GoneExecutor;
        #[async_trait]
        impl JobExecutor for GoneExecutor {
            async fn execute(&self, job: &DownloadJob) -> Result<(), DownloadError> {
                if job.post.id < 4 {
                    Err(DownloadError::Status {
                        status: 404,
                        url: "stub".into(),
                    })
                } else {
                    Ok(())
                }
            }
        }

        let report = run_jobs(
            jobs,
            Arc::new(GoneExecutor),
            &quick_config(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(report.downloaded, 6);
        assert_eq!(report.skipped, 4);
        assert!(report.failed.is_empty());
    }
}
