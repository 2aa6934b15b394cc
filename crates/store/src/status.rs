//! Cluster status board: serialized writers, lock-free snapshot readers.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use stellar_core::{ClusterStatus, ClusterStatusEntry};
use tracing::debug;

type StatusMap = FxHashMap<String, ClusterStatus>;

pub struct StatusBoard {
    write: Mutex<()>,
    snap: ArcSwap<StatusMap>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self { write: Mutex::new(()), snap: ArcSwap::from_pointee(StatusMap::default()) }
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-write update; `f` returns whether it changed anything.
    fn update<R>(&self, f: impl FnOnce(&mut StatusMap) -> (R, bool)) -> R {
        let _guard = self.write.lock();
        let mut next = (*self.snap.load_full()).clone();
        let (out, changed) = f(&mut next);
        if changed {
            self.snap.store(Arc::new(next));
        }
        out
    }

    pub fn get(&self, name: &str) -> Option<ClusterStatus> {
        self.snap.load().get(name).copied()
    }

    /// All entries ordered by cluster name.
    pub fn snapshot(&self) -> Vec<ClusterStatusEntry> {
        let snap = self.snap.load_full();
        let mut out: Vec<_> =
            snap.iter().map(|(k, v)| ClusterStatusEntry { cluster_name: k.clone(), status: *v }).collect();
        out.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));
        out
    }

    /// Insert unless an entry exists; the existing status is returned as the error.
    pub fn insert_if_absent(&self, name: &str, status: ClusterStatus) -> Result<(), ClusterStatus> {
        self.update(|m| match m.get(name) {
            Some(existing) => (Err(*existing), false),
            None => {
                m.insert(name.to_string(), status);
                (Ok(()), true)
            }
        })
    }

    /// Set `status` when `admit` accepts the current value. `on_claimed` runs
    /// before readers can observe the new status. Refusals return the current value.
    pub fn claim(
        &self,
        name: &str,
        status: ClusterStatus,
        admit: impl FnOnce(Option<ClusterStatus>) -> bool,
        on_claimed: impl FnOnce(),
    ) -> Result<(), Option<ClusterStatus>> {
        self.update(|m| {
            let current = m.get(name).copied();
            if !admit(current) {
                return (Err(current), false);
            }
            on_claimed();
            m.insert(name.to_string(), status);
            (Ok(()), true)
        })
    }

    /// Last-write-wins assignment.
    pub fn set(&self, name: &str, status: ClusterStatus) {
        self.update(|m| {
            let prev = m.insert(name.to_string(), status);
            ((), prev != Some(status))
        });
        debug!(cluster = %name, status = %status, "status set");
    }

    /// Move `name` from `from` to `to`; refused when the current status differs.
    pub fn transition(&self, name: &str, from: ClusterStatus, to: ClusterStatus) -> bool {
        let ok = self.update(|m| match m.get_mut(name) {
            Some(cur) if *cur == from => {
                *cur = to;
                (true, true)
            }
            _ => (false, false),
        });
        debug!(cluster = %name, from = %from, to = %to, applied = ok, "status transition");
        ok
    }

    /// Remove the entry only while it still holds `expected`.
    pub fn remove_if(&self, name: &str, expected: ClusterStatus) -> bool {
        self.update(|m| match m.get(name) {
            Some(cur) if *cur == expected => {
                m.remove(name);
                (true, true)
            }
            _ => (false, false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_reports_existing() {
        let board = StatusBoard::new();
        assert_eq!(board.insert_if_absent("c1", ClusterStatus::Pending), Ok(()));
        assert_eq!(board.insert_if_absent("c1", ClusterStatus::Pending), Err(ClusterStatus::Pending));
        assert_eq!(board.get("c1"), Some(ClusterStatus::Pending));
    }

    #[test]
    fn transitions_are_guarded() {
        let board = StatusBoard::new();
        board.set("c1", ClusterStatus::Pending);
        assert!(!board.transition("c1", ClusterStatus::Detaching, ClusterStatus::DetachmentFailed));
        assert!(board.transition("c1", ClusterStatus::Pending, ClusterStatus::Onboarded));
        assert!(!board.transition("c1", ClusterStatus::Pending, ClusterStatus::Failed));
        assert_eq!(board.get("c1"), Some(ClusterStatus::Onboarded));
        assert!(!board.remove_if("c1", ClusterStatus::Detaching));
        board.set("c1", ClusterStatus::Detaching);
        assert!(board.remove_if("c1", ClusterStatus::Detaching));
        assert_eq!(board.get("c1"), None);
    }

    #[test]
    fn claim_runs_hook_only_when_admitted() {
        let board = StatusBoard::new();
        let mut hooked = 0;
        let busy = |cur: Option<ClusterStatus>| !cur.is_some_and(ClusterStatus::is_in_progress);
        assert_eq!(board.claim("c1", ClusterStatus::Detaching, busy, || hooked += 1), Ok(()));
        assert_eq!(
            board.claim("c1", ClusterStatus::Detaching, busy, || hooked += 1),
            Err(Some(ClusterStatus::Detaching))
        );
        assert_eq!(hooked, 1);
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let board = StatusBoard::new();
        board.set("zeta", ClusterStatus::Failed);
        board.set("alpha", ClusterStatus::Onboarded);
        let snap = board.snapshot();
        board.set("alpha", ClusterStatus::Detaching);
        let names: Vec<_> = snap.iter().map(|e| e.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(snap[0].status, ClusterStatus::Onboarded);
    }
}
