//! Failure ledger: downloads that did not complete, made durable between
//! runs.
//!
//! The ledger maps target ids to the posts still owed to them, de-duplicated
//! per bucket by post id. It is serialized to a flat JSON file at process
//! exit and reloaded on the next run; a missing file is an empty ledger.
//! The ledger is only touched before and after the concurrent phase, so it
//! needs no internal locking.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;

use crate::api::Post;
use crate::pipeline::DownloadJob;
use crate::store::RecordStore;

#[derive(Default)]
pub struct FailureLedger {
    buckets: HashMap<i64, Vec<Post>>,
    seen: HashMap<i64, HashSet<u64>>,
    count: usize,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a post to a target's bucket unless it is already there. Returns
    /// the number of posts actually added (0 for a duplicate).
    pub fn push(&mut self, target_id: i64, post: Post) -> usize {
        let seen = self.seen.entry(target_id).or_default();
        if !seen.insert(post.id) {
            return 0;
        }
        self.buckets.entry(target_id).or_default().push(post);
        self.count += 1;
        1
    }

    /// Add every failed job from a pipeline pass. Returns the number added.
    pub fn push_jobs(&mut self, jobs: impl IntoIterator<Item = DownloadJob>) -> usize {
        jobs.into_iter()
            .map(|job| self.push(job.target_id, job.post))
            .sum()
    }

    /// Read a persisted ledger and merge it in. A missing file is empty.
    pub fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read ledger {}", path.display()))
            }
        };
        let loaded: HashMap<i64, Vec<Post>> = serde_json::from_slice(&data)
            .with_context(|| format!("ledger {} is not valid JSON", path.display()))?;
        for (target_id, posts) in loaded {
            for post in posts {
                self.push(target_id, post);
            }
        }
        Ok(())
    }

    /// Serialize the ledger, replacing any previous file content.
    pub fn dump(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(&self.buckets)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write ledger {}", path.display()))?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.seen.clear();
        self.count = 0;
    }

    /// Total posts across all buckets.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Resolve every bucket against the record store and flatten into jobs
    /// ready for resubmission to the pipeline's consumer stage.
    ///
    /// A bucket whose target record has been deleted is a hard error: the
    /// ledger and store have diverged, which is a caller bug rather than an
    /// environmental condition.
    pub async fn materialize(
        &self,
        store: &dyn RecordStore,
        users_dir: &Path,
    ) -> anyhow::Result<Vec<DownloadJob>> {
        let mut jobs = Vec::with_capacity(self.count);
        for (&target_id, posts) in &self.buckets {
            let record = store
                .get_target(target_id)
                .await?
                .with_context(|| format!("ledger references target {target_id}, which no longer exists"))?;
            let dir = users_dir.join(&record.folder_name);
            for post in posts {
                jobs.push(DownloadJob {
                    target_id,
                    account_id: record.user_id,
                    dir: dir.clone(),
                    post: post.clone(),
                });
            }
        }
        Ok(jobs)
    }
}
