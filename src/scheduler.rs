//! Fetch scheduling: which target next, and how many pages it will need.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::api::PAGE_SIZE;

/// One account being mirrored, as prepared for this run.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    /// Record-store row id. Stable identity: the heap ranks ids, not
    /// references, so targets survive requeueing and ledger round-trips.
    pub id: i64,
    pub account_id: u64,
    pub title: String,
    /// Folder the target's media lands in; created lazily on first write.
    pub dir: PathBuf,
    /// Newest post timestamp already mirrored; fetches resume past it.
    pub cursor: Option<DateTime<Utc>>,
    /// Media count recorded locally on a previous run.
    pub known_count: u32,
    /// Media count the account reports as of this run.
    pub remote_count: u32,
    /// Only the master session can see this target's content.
    pub exclusive: bool,
    /// Fetch attempts spent on this target within this run.
    pub attempts: u32,
}

impl SyncTarget {
    pub fn depth(&self) -> u32 {
        calc_depth(self.known_count, self.remote_count, PAGE_SIZE)
    }
}

/// Estimate how many paginated fetches close the gap between the locally
/// known and remotely reported media counts.
///
/// A caught-up target still costs one confirmation fetch. A brand-new
/// target pays one extra page: exhaustion is only confirmed by an empty
/// page, never by count arithmetic.
pub fn calc_depth(known: u32, remote: u32, page_size: u32) -> u32 {
    if known >= remote {
        return 1;
    }
    let miss = remote - known;
    let mut depth = miss.div_ceil(page_size);
    if known == 0 {
        depth += 1;
    }
    depth
}

/// Heap rank for one target. Exclusive-visibility targets drain first —
/// only one session can serve them, and starting them early avoids tail
/// latency. Within a tier, deeper targets come first so the longest fetches
/// overlap with everything else instead of serializing at the end.
#[derive(Debug, PartialEq, Eq)]
struct Rank {
    exclusive: bool,
    depth: u32,
    id: i64,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.exclusive
            .cmp(&other.exclusive)
            .then(self.depth.cmp(&other.depth))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue over sync targets: an arena keyed by target id plus a
/// max-heap of ranks.
pub struct Scheduler {
    heap: BinaryHeap<Rank>,
    targets: HashMap<i64, SyncTarget>,
}

impl Scheduler {
    /// Seed the scheduler. Callers filter out muted/blocked accounts before
    /// this point; an empty seed means the whole run has nothing to do,
    /// which is reported as an error rather than a silent no-op.
    pub fn new(targets: Vec<SyncTarget>) -> anyhow::Result<Self> {
        if targets.is_empty() {
            anyhow::bail!("no target to sync: every requested account was filtered out");
        }
        let mut scheduler = Self {
            heap: BinaryHeap::with_capacity(targets.len()),
            targets: HashMap::with_capacity(targets.len()),
        };
        for target in targets {
            scheduler.push(target);
        }
        Ok(scheduler)
    }

    pub fn push(&mut self, target: SyncTarget) {
        self.heap.push(Rank {
            exclusive: target.exclusive,
            depth: target.depth(),
            id: target.id,
        });
        self.targets.insert(target.id, target);
    }

    pub fn pop(&mut self) -> Option<SyncTarget> {
        loop {
            let rank = self.heap.pop()?;
            // Ranks for requeued targets go stale; the arena is the truth.
            if let Some(target) = self.targets.remove(&rank.id) {
                return Some(target);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: i64, exclusive: bool, known: u32, remote: u32) -> SyncTarget {
        SyncTarget {
            id,
            account_id: id as u64,
            title: format!("user{id}"),
            dir: PathBuf::from(format!("/tmp/users/user{id}")),
            cursor: None,
            known_count: known,
            remote_count: remote,
            exclusive,
            attempts: 0,
        }
    }

    #[test]
    fn depth_edge_cases() {
        assert_eq!(calc_depth(0, 0, 70), 2);
        assert_eq!(calc_depth(100, 50, 70), 1);
        assert_eq!(calc_depth(0, 140, 70), 3);
        assert_eq!(calc_depth(10, 80, 70), 1);
        assert_eq!(calc_depth(0, 150, 70), 4);
    }

    #[test]
    fn depth_monotonic_in_known_and_remote() {
        // Non-increasing as the local archive grows.
        for remote in [0u32, 1, 69, 70, 150, 1000] {
            let mut prev = u32::MAX;
            for known in 0..=remote {
                let d = calc_depth(known, remote, 70);
                assert!(d <= prev, "depth increased at known={known} remote={remote}");
                prev = d;
            }
        }
        // Non-decreasing as the remote archive grows.
        for known in [0u32, 10, 70, 150] {
            let mut prev = 0;
            for remote in known..known + 500 {
                let d = calc_depth(known, remote, 70);
                assert!(d >= prev, "depth decreased at known={known} remote={remote}");
                prev = d;
            }
        }
    }

    #[test]
    fn pops_exclusive_tier_first_then_by_depth() {
        // A: exclusive, depth 1; B: public, depth 10; C: exclusive, depth 5.
        let a = target(1, true, 100, 50);
        let b = target(2, false, 0, 630);
        let c = target(3, true, 70, 400);
        let mut scheduler = Scheduler::new(vec![a, b, c]).unwrap();

        let order: Vec<i64> = std::iter::from_fn(|| scheduler.pop().map(|t| t.id)).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn requeued_target_keeps_its_priority() {
        let mut scheduler = Scheduler::new(vec![
            target(1, false, 0, 700),
            target(2, false, 0, 70),
        ])
        .unwrap();
        let first = scheduler.pop().unwrap();
        assert_eq!(first.id, 1);
        scheduler.push(first);
        assert_eq!(scheduler.pop().unwrap().id, 1);
        assert_eq!(scheduler.pop().unwrap().id, 2);
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn stale_ranks_are_discarded() {
        let mut scheduler = Scheduler::new(vec![target(1, false, 0, 700)]).unwrap();
        let t = scheduler.pop().unwrap();
        scheduler.push(t.clone());
        scheduler.push(t); // same id twice: one arena slot, two ranks
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.pop().is_some());
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn empty_seed_is_an_error() {
        assert!(Scheduler::new(Vec::new()).is_err());
    }
}
