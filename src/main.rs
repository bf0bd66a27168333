//! xmirror — incremental X/Twitter media mirror.
//!
//! Authenticates one or more cookie-based sessions, schedules per-account
//! fetches by estimated depth, and runs a rate-governed producer/consumer
//! pipeline that turns timelines into files on disk. Downloads that fail
//! are persisted to a JSON ledger and retried before exit and on the next
//! run, so interrupted runs lose no work.

#![warn(clippy::all)]

mod api;
mod cli;
mod config;
mod ledger;
mod pipeline;
mod ratelimit;
mod retry;
mod scheduler;
mod session;
mod shutdown;
mod storage;
mod store;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use api::{FetchError, FollowState, User};
use config::Config;
use ledger::FailureLedger;
use pipeline::{MediaDownloader, PipelineConfig};
use scheduler::{Scheduler, SyncTarget};
use session::{ApiCounters, Credentials, Session, SessionPool};
use storage::MirrorLayout;
use store::{RecordStore, TargetRecord};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let filter = match cli.log_level {
        cli::LogLevel::Debug => "debug",
        cli::LogLevel::Info => "info",
        cli::LogLevel::Warn => "warn",
        cli::LogLevel::Error => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    let debug_report = matches!(cli.log_level, cli::LogLevel::Debug);

    let config = Config::from_cli(cli)?;
    let layout = MirrorLayout::prepare(&config.directory)
        .with_context(|| format!("failed to prepare mirror root {}", config.directory.display()))?;
    tracing::info!(
        root = %layout.root.display(),
        concurrency = config.concurrency,
        "starting xmirror"
    );

    let store: Arc<dyn RecordStore> =
        Arc::new(store::SqliteRecordStore::open(&layout.db_path)?);

    let counters = Arc::new(ApiCounters::default());
    let master = Session::login(&config.master, counters.clone())
        .await
        .context("master session login failed")?;
    tracing::info!(session = master.screen_name(), "signed in");
    let mut pool = SessionPool::new(master, counters.clone());
    batch_login(&mut pool, &config.accounts, counters).await;

    let mut ledger = FailureLedger::new();
    ledger.load(&layout.ledger_path)?;
    if ledger.count() > 0 {
        tracing::info!(count = ledger.count(), "loaded previously failed downloads");
    }

    let cancel = shutdown::install_signal_handler();

    let pipeline_config = PipelineConfig {
        concurrency: config.concurrency,
        no_progress_bar: config.no_progress_bar,
    };
    let executor = Arc::new(MediaDownloader::new(
        store.clone(),
        retry::RetryConfig::default(),
    )?);

    if !config.users.is_empty() {
        match prepare_targets(&config, &pool, store.as_ref(), &layout, &cancel).await {
            Ok(targets) => match Scheduler::new(targets) {
                Ok(sched) => {
                    let report = pipeline::run(
                        sched,
                        &pool,
                        &api::GraphqlTimeline,
                        executor.clone(),
                        store.as_ref(),
                        &pipeline_config,
                        &cancel,
                    )
                    .await;
                    report.log_summary("main");
                    if let Some(e) = &report.error {
                        tracing::error!(error = %e, "main pass ended with a fatal error");
                    }
                    ledger.push_jobs(report.failed);
                }
                Err(e) => tracing::error!(error = %e, "nothing to sync"),
            },
            Err(e) => tracing::error!(error = %e, "failed to prepare targets"),
        }
    }

    // Retry pass at exit. A manual interrupt skips it so Ctrl+C stays fast;
    // the dumped ledger covers the next run either way.
    if !cancel.is_cancelled() && !config.no_retry && ledger.count() > 0 {
        tracing::info!(count = ledger.count(), "retrying previously failed downloads");
        match ledger.materialize(store.as_ref(), &layout.users_dir).await {
            Ok(jobs) => {
                ledger.clear();
                let report =
                    pipeline::run_jobs(jobs, executor.clone(), &pipeline_config, &cancel).await;
                report.log_summary("retry");
                ledger.push_jobs(report.failed);
            }
            Err(e) => {
                tracing::error!(error = %e, "could not materialize the ledger, keeping it for the next run");
            }
        }
    }

    ledger.dump(&layout.ledger_path)?;
    if ledger.count() > 0 {
        tracing::info!(
            count = ledger.count(),
            "failed downloads saved, they will be retried on the next run"
        );
    }

    if debug_report {
        pool.report_api_counts();
    }
    Ok(())
}

/// Sign in the additional accounts concurrently and add them to the pool.
/// Failures and duplicate identities are skipped with a notice; the run
/// proceeds with whatever sessions authenticated.
async fn batch_login(pool: &mut SessionPool, accounts: &[Credentials], counters: Arc<ApiCounters>) {
    if accounts.is_empty() {
        return;
    }
    let logins = join_all(
        accounts
            .iter()
            .map(|creds| Session::login(creds, counters.clone())),
    )
    .await;

    for result in logins {
        match result {
            Ok(session) => {
                let name = session.screen_name().to_string();
                match pool.add(session) {
                    Ok(()) => tracing::info!(session = %name, "additional session signed in"),
                    Err(e) => tracing::warn!(session = %name, "{e}, skipping"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to sign in an additional account"),
        }
    }
    tracing::info!(total = pool.len(), "session pool ready");
}

/// Resolve the requested accounts and build the run's sync targets: profile
/// rows upserted, target rows created or renamed, cursors loaded, depth
/// inputs and visibility computed. Muted, blocked, empty, and invisible
/// accounts are filtered here, before the scheduler is built.
async fn prepare_targets(
    config: &Config,
    pool: &SessionPool,
    store: &dyn RecordStore,
    layout: &MirrorLayout,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<SyncTarget>> {
    let master = pool.master();
    let mut targets = Vec::new();

    for selector in &config.users {
        if cancel.is_cancelled() {
            break;
        }
        let user = match resolve_user(&master, selector, cancel).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user = selector.as_str(), error = %e, "failed to resolve account, skipping");
                continue;
            }
        };
        if user.is_ignored() {
            tracing::debug!(user = %user.title(), "account is muted or blocked, skipping");
            continue;
        }

        if config.auto_follow && user.protected && user.follow_state == FollowState::Unfollowed {
            match api::follow(&master, user.id, cancel).await {
                Ok(()) => tracing::debug!(user = %user.title(), "follow request sent"),
                Err(e) => {
                    tracing::warn!(user = %user.title(), error = %e, "failed to send follow request")
                }
            }
        }

        if user.media_count == 0 || !user.is_visible() {
            tracing::debug!(user = %user.title(), "nothing visible to mirror, skipping");
            continue;
        }

        store.upsert_user(&user).await?;
        let record = sync_target_record(store, layout, &user).await?;

        // Only the master session's follow grants visibility into a
        // protected account.
        let exclusive = user.protected && user.follow_state == FollowState::Following;

        targets.push(SyncTarget {
            id: record.id,
            account_id: user.id,
            title: user.title(),
            dir: layout.users_dir.join(&record.folder_name),
            cursor: record.latest_post_at,
            known_count: record.media_count,
            remote_count: user.media_count,
            exclusive,
            attempts: 0,
        });
    }

    Ok(targets)
}

/// Fetch or create the target row for an account, renaming its folder when
/// the account's name changed since the last run.
async fn sync_target_record(
    store: &dyn RecordStore,
    layout: &MirrorLayout,
    user: &User,
) -> anyhow::Result<TargetRecord> {
    let folder_name = storage::legal_file_name(&user.title());
    match store.get_target_by_user(user.id).await? {
        Some(record) if record.folder_name != folder_name => {
            let old_dir = layout.users_dir.join(&record.folder_name);
            let new_dir = layout.users_dir.join(&folder_name);
            if old_dir.exists() {
                if let Err(e) = std::fs::rename(&old_dir, &new_dir) {
                    tracing::warn!(user = %user.title(), error = %e, "failed to rename target folder");
                }
            }
            store.set_target_folder(record.id, &folder_name).await?;
            Ok(TargetRecord {
                folder_name,
                ..record
            })
        }
        Some(record) => Ok(record),
        None => Ok(store.create_target(user.id, &folder_name).await?),
    }
}

async fn resolve_user(
    session: &Session,
    selector: &str,
    cancel: &CancellationToken,
) -> Result<User, FetchError> {
    match selector.parse::<u64>() {
        Ok(id) => api::user_by_id(session, id, cancel).await,
        Err(_) => api::user_by_screen_name(session, selector, cancel).await,
    }
}
