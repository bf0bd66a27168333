//! Local mirror storage: directory layout, filename handling, and the
//! streaming media transfer.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::retry::{self, RetryAction, RetryConfig};

/// Filename length cap, in bytes, before the extension. Post text is used
/// as the filename and can exceed filesystem limits.
const MAX_FILE_STEM: usize = 120;

/// Typed media transfer errors enabling retry classification.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http status {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("transfer failed for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("unsupported media url {0}")]
    UnsupportedUrl(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DownloadError {
    /// Whether this error is transient and worth retrying within the same
    /// transfer.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Status { status, .. } => *status == 429 || *status >= 500,
            DownloadError::Http { .. } => true,
            DownloadError::Disk(_) => false,
            DownloadError::UnsupportedUrl(_) => false,
            DownloadError::Other(_) => false,
        }
    }

    /// Media that is gone (404) or taken down (403) is skipped rather than
    /// requeued; it will never download on any retry.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            DownloadError::Status {
                status: 403 | 404,
                ..
            }
        )
    }

    /// Out of disk space is fatal for the whole pipeline, not just this job.
    pub fn is_disk_full(&self) -> bool {
        match self {
            DownloadError::Disk(e) => {
                e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
            }
            _ => false,
        }
    }
}

/// On-disk layout of one mirror root.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    pub root: PathBuf,
    /// One folder per mirrored account.
    pub users_dir: PathBuf,
    pub db_path: PathBuf,
    /// The failure ledger file.
    pub ledger_path: PathBuf,
}

impl MirrorLayout {
    /// Resolve the layout under `root`, creating the directories.
    pub fn prepare(root: &Path) -> std::io::Result<Self> {
        let users_dir = root.join("users");
        std::fs::create_dir_all(&users_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            users_dir,
            db_path: root.join("xmirror.db"),
            ledger_path: root.join("errors.json"),
        })
    }
}

/// Reduce a string to a name legal on every supported filesystem: strips
/// path separators, reserved punctuation, and control characters, and caps
/// the length on a character boundary.
pub fn legal_file_name(text: &str) -> String {
    let mut name = String::with_capacity(text.len().min(MAX_FILE_STEM));
    for c in text.chars() {
        let c = match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => ' ',
            c if c.is_control() => ' ',
            c => c,
        };
        // Collapse runs of separators so stripped punctuation reads cleanly.
        if c == ' ' && (name.is_empty() || name.ends_with(' ')) {
            continue;
        }
        if name.len() + c.len_utf8() > MAX_FILE_STEM {
            break;
        }
        name.push(c);
    }
    let name = name.trim_end_matches([' ', '.']);
    if name.is_empty() {
        "media".to_string()
    } else {
        name.to_string()
    }
}

/// File extension implied by a media URL's path, dot included.
pub fn ext_from_url(url: &str) -> Result<String, DownloadError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| DownloadError::UnsupportedUrl(url.to_string()))?;
    let ext = Path::new(parsed.path())
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .ok_or_else(|| DownloadError::UnsupportedUrl(url.to_string()))?;
    Ok(format!(".{ext}"))
}

/// Atomically claim an unused path in `dir` by creating the file with
/// `create_new`. Collisions get a ` (n)` suffix; concurrent workers racing
/// for the same name each end up with a distinct file.
async fn claim_unique_path(dir: &Path, stem: &str, ext: &str) -> std::io::Result<PathBuf> {
    for n in 0u32.. {
        let candidate = if n == 0 {
            dir.join(format!("{stem}{ext}"))
        } else {
            dir.join(format!("{stem} ({n}){ext}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    unreachable!("u32 suffixes exhausted");
}

/// Download one media URL into `dir`, naming the file after the post text.
///
/// The transfer streams to disk, retries transient failures with backoff,
/// stamps the file's mtime with the post's creation time, and removes the
/// claimed file when every attempt failed.
pub async fn download_media(
    client: &Client,
    url: &str,
    dir: &Path,
    text: &str,
    created_at: DateTime<Utc>,
    retry_config: &RetryConfig,
) -> Result<PathBuf, DownloadError> {
    let ext = ext_from_url(url)?;
    let stem = legal_file_name(text);
    let path = claim_unique_path(dir, &stem, &ext).await?;

    let result = retry::retry_with_backoff(
        retry_config,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || attempt_transfer(client, url, &path),
    )
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&path).await;
        return Err(e);
    }

    let mtime_path = path.clone();
    let ts = created_at.timestamp();
    match tokio::task::spawn_blocking(move || set_file_mtime(&mtime_path, ts)).await {
        Ok(Err(e)) => tracing::warn!("could not set mtime on {}: {}", path.display(), e),
        Err(e) => tracing::warn!("mtime task failed: {e}"),
        Ok(Ok(())) => {}
    }

    Ok(path)
}

/// Single transfer attempt: fetch at full resolution and stream to `path`,
/// truncating whatever a previous attempt left behind.
async fn attempt_transfer(client: &Client, url: &str, path: &Path) -> Result<(), DownloadError> {
    let resp = client
        .get(url)
        .query(&[("name", "4096x4096")])
        .send()
        .await
        .map_err(|e| DownloadError::Http {
            url: url.to_string(),
            source: e,
        })?;

    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Http {
            url: url.to_string(),
            source: e,
        })?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Set a file's modification and access times to the given Unix timestamp,
/// clamping pre-epoch values.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
    };
    let times = std::fs::FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_file_name_strips_reserved_characters() {
        assert_eq!(legal_file_name("a/b\\c:d"), "a b c d");
        assert_eq!(legal_file_name("what? a *post*"), "what a post");
        assert_eq!(legal_file_name("line\nbreak"), "line break");
        assert_eq!(legal_file_name("trailing dots..."), "trailing dots");
    }

    #[test]
    fn legal_file_name_never_empty() {
        assert_eq!(legal_file_name(""), "media");
        assert_eq!(legal_file_name("???"), "media");
    }

    #[test]
    fn legal_file_name_caps_length() {
        let long = "x".repeat(500);
        assert!(legal_file_name(&long).len() <= MAX_FILE_STEM);
        // Multi-byte characters are not split.
        let unicode = "é".repeat(500);
        let name = legal_file_name(&unicode);
        assert!(name.len() <= MAX_FILE_STEM);
        assert!(name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn ext_from_url_handles_photos_and_videos() {
        assert_eq!(
            ext_from_url("https://pbs.twimg.com/media/Fabc123.jpg").unwrap(),
            ".jpg"
        );
        assert_eq!(
            ext_from_url("https://video.twimg.com/ext_tw_video/1/pu/vid/720x720/x.mp4?tag=12")
                .unwrap(),
            ".mp4"
        );
        assert!(ext_from_url("https://pbs.twimg.com/media/noext").is_err());
        assert!(ext_from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn claim_unique_path_disambiguates_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = claim_unique_path(dir.path(), "post", ".jpg").await.unwrap();
        let second = claim_unique_path(dir.path(), "post", ".jpg").await.unwrap();
        let third = claim_unique_path(dir.path(), "post", ".jpg").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "post.jpg");
        assert_eq!(second.file_name().unwrap(), "post (1).jpg");
        assert_eq!(third.file_name().unwrap(), "post (2).jpg");
    }

    #[test]
    fn mirror_layout_creates_users_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MirrorLayout::prepare(dir.path()).unwrap();
        assert!(layout.users_dir.is_dir());
        assert_eq!(layout.db_path, dir.path().join("xmirror.db"));
        assert_eq!(layout.ledger_path, dir.path().join("errors.json"));
    }

    #[test]
    fn set_file_mtime_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamp.txt");
        std::fs::write(&path, b"x").unwrap();
        set_file_mtime(&path, 1_700_000_000).unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        // Pre-epoch timestamps clamp instead of failing.
        set_file_mtime(&path, -86_400).unwrap();
    }

    #[test]
    fn error_classification() {
        let gone = DownloadError::Status {
            status: 404,
            url: "u".into(),
        };
        assert!(gone.is_skippable());
        assert!(!gone.is_retryable());

        let throttled = DownloadError::Status {
            status: 429,
            url: "u".into(),
        };
        assert!(throttled.is_retryable());
        assert!(!throttled.is_skippable());

        let server = DownloadError::Status {
            status: 503,
            url: "u".into(),
        };
        assert!(server.is_retryable());

        let disk = DownloadError::Disk(std::io::Error::from_raw_os_error(28));
        assert!(disk.is_disk_full());
        assert!(!disk.is_retryable());
    }
}
