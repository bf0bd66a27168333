use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser, Debug)]
#[command(name = "xmirror", about = "Mirror X/Twitter posts and media to local storage")]
pub struct Cli {
    /// Account to mirror, by screen name or numeric id (repeatable)
    #[arg(short = 'u', long = "user")]
    pub users: Vec<String>,

    /// Mirror root directory
    #[arg(short = 'd', long, default_value = "~/.xmirror")]
    pub directory: String,

    /// auth_token cookie of the master account.
    /// WARNING: passing via --auth-token is visible in process listings.
    /// Prefer the XMIRROR_AUTH_TOKEN environment variable instead.
    #[arg(long, env = "XMIRROR_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: String,

    /// ct0 (CSRF) cookie of the master account
    #[arg(long, env = "XMIRROR_CSRF_TOKEN", hide_env_values = true)]
    pub csrf_token: String,

    /// JSON file with additional account cookies:
    /// [{"auth_token": "...", "csrf_token": "..."}, ...]
    #[arg(long)]
    pub accounts_file: Option<String>,

    /// Concurrent media downloads (default: derived from CPU count)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Exit without retrying previously failed downloads
    #[arg(long)]
    pub no_retry: bool,

    /// Send follow requests to protected accounts that are not yet followed
    #[arg(long)]
    pub auto_follow: bool,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}
