use std::path::PathBuf;

use anyhow::Context;

use crate::cli::Cli;
use crate::session::Credentials;

/// Hard cap on the consumer pool, independent of how many cores the host
/// reports; the media host throttles past this anyway.
const MAX_CONCURRENCY: usize = 100;

/// Application configuration, assembled from the CLI, the environment, and
/// the optional accounts file.
#[derive(Debug)]
pub struct Config {
    /// Requested targets: screen names or numeric account ids.
    pub users: Vec<String>,
    /// Mirror root; holds the users directory, the database, and the ledger.
    pub directory: PathBuf,
    /// Master account credentials.
    pub master: Credentials,
    /// Additional account credentials for the session pool.
    pub accounts: Vec<Credentials>,
    pub concurrency: usize,
    pub no_retry: bool,
    pub auto_follow: bool,
    pub no_progress_bar: bool,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 10).min(MAX_CONCURRENCY)
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let accounts = match &cli.accounts_file {
            Some(path) => {
                let path = expand_tilde(path);
                let data = std::fs::read(&path)
                    .with_context(|| format!("failed to read accounts file {}", path.display()))?;
                serde_json::from_slice::<Vec<Credentials>>(&data)
                    .with_context(|| format!("accounts file {} is not valid JSON", path.display()))?
            }
            None => Vec::new(),
        };

        Ok(Self {
            users: cli.users,
            directory: expand_tilde(&cli.directory),
            master: Credentials {
                auth_token: cli.auth_token,
                csrf_token: cli.csrf_token,
            },
            accounts,
            concurrency: cli.concurrency.unwrap_or_else(default_concurrency),
            no_retry: cli.no_retry,
            auto_follow: cli.auto_follow,
            no_progress_bar: cli.no_progress_bar,
        })
    }
}
