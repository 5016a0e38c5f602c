//! Pending versions - received versions awaiting their parents

use std::collections::{BTreeSet, VecDeque};

use arbor_core::{PeerId, VersionId, VersionInfo};
use tracing::warn;

use crate::History;

/// Default number of parked versions per object
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Default number of collapsed version ids remembered per object
pub const DEFAULT_FOLDED_CAPACITY: usize = 4096;

/// Version parked until it can be inserted
#[derive(Clone, Debug, PartialEq)]
pub struct PendingVersion {
    /// Peer that delivered it
    pub from: PeerId,
    pub info: VersionInfo,
}

/// Bounded FIFO of parked versions for one object
#[derive(Clone, Debug)]
pub struct PendingVersions {
    capacity: usize,
    queue: VecDeque<PendingVersion>,
}

impl Default for PendingVersions {
    fn default() -> Self {
        PendingVersions::with_capacity(DEFAULT_PENDING_CAPACITY)
    }
}

impl PendingVersions {
    pub fn with_capacity(capacity: usize) -> Self {
        PendingVersions {
            capacity,
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a version with this id is already parked
    pub fn contains(&self, info: &VersionInfo) -> bool {
        self.queue.iter().any(|p| p.info.id == info.id)
    }

    /// Park a version. Returns the oldest entry if it had to be dropped.
    pub fn park(&mut self, from: PeerId, info: VersionInfo) -> Option<PendingVersion> {
        if self.contains(&info) {
            return None;
        }
        if self.capacity == 0 {
            warn!(version = %info.id, "pending buffer disabled, dropping version");
            return Some(PendingVersion { from, info });
        }

        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        if let Some(old) = &dropped {
            warn!(version = %old.info.id, "pending buffer full, dropping oldest version");
        }
        self.queue.push_back(PendingVersion { from, info });
        dropped
    }

    /// Take every parked version that could now be inserted into `history`,
    /// oldest first. Versions already present are released as well.
    pub fn release(&mut self, history: &History) -> Vec<PendingVersion> {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|p| is_insertable(history, &p.info));

        self.queue = waiting;
        ready.into_iter().collect()
    }
}

/// Ids of recently collapsed versions of one object.
///
/// A copy of a folded version that arrives late has lost its parents, so
/// without this record it would look like an orphan and stay parked.
#[derive(Clone, Debug)]
pub struct FoldedVersions {
    capacity: usize,
    order: VecDeque<VersionId>,
    ids: BTreeSet<VersionId>,
}

impl Default for FoldedVersions {
    fn default() -> Self {
        FoldedVersions::with_capacity(DEFAULT_FOLDED_CAPACITY)
    }
}

impl FoldedVersions {
    pub fn with_capacity(capacity: usize) -> Self {
        FoldedVersions {
            capacity,
            order: VecDeque::new(),
            ids: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &VersionId) -> bool {
        self.ids.contains(id)
    }

    /// Remember folded ids, forgetting the oldest beyond capacity
    pub fn record<'a>(&mut self, ids: impl IntoIterator<Item = &'a VersionId>) {
        for id in ids {
            if self.capacity == 0 || !self.ids.insert(id.clone()) {
                continue;
            }
            self.order.push_back(id.clone());
            if self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
    }
}

/// Whether inserting `info` would succeed or be a duplicate
pub fn is_insertable(history: &History, info: &VersionInfo) -> bool {
    if history.contains(&info.id) {
        return true;
    }
    if info.parents.is_empty() {
        return history.is_empty();
    }
    history.root.is_some() && info.parents.iter().all(|p| history.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::VersionId;

    fn info(id: &str, parents: &[&str]) -> VersionInfo {
        VersionInfo::new(
            id.into(),
            parents.iter().map(|p| VersionId::from(*p)).collect(),
            vec![],
        )
    }

    #[test]
    fn test_park_drops_oldest_when_full() {
        let mut pending = PendingVersions::with_capacity(2);
        assert!(pending.park("p".into(), info("v1", &["x"])).is_none());
        assert!(pending.park("p".into(), info("v2", &["x"])).is_none());

        let dropped = pending.park("p".into(), info("v3", &["x"])).unwrap();
        assert_eq!(dropped.info.id, VersionId::from("v1"));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_park_ignores_duplicates() {
        let mut pending = PendingVersions::default();
        pending.park("p".into(), info("v1", &["x"]));
        pending.park("q".into(), info("v1", &["x"]));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_release_only_ready_versions() {
        let mut history = History::new();
        history.insert(info("a1", &[])).unwrap();

        let mut pending = PendingVersions::default();
        pending.park("p".into(), info("a3", &["a2"]));
        pending.park("p".into(), info("a2", &["a1"]));

        let ready = pending.release(&history);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].info.id, VersionId::from("a2"));
        assert_eq!(pending.len(), 1);

        history.insert(ready[0].info.clone()).unwrap();
        let ready = pending.release(&history);
        assert_eq!(ready[0].info.id, VersionId::from("a3"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_folded_forgets_oldest() {
        let mut folded = FoldedVersions::with_capacity(2);
        let ids: Vec<VersionId> = ["v1", "v2", "v3", "v2"]
            .into_iter()
            .map(VersionId::from)
            .collect();
        folded.record(&ids);

        assert_eq!(folded.len(), 2);
        assert!(!folded.contains(&VersionId::from("v1")));
        assert!(folded.contains(&VersionId::from("v2")));
        assert!(folded.contains(&VersionId::from("v3")));

        let mut disabled = FoldedVersions::with_capacity(0);
        disabled.record(&ids);
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_root_waits_for_empty_history() {
        let mut history = History::new();
        history.insert(info("a1", &[])).unwrap();
        assert!(!is_insertable(&history, &info("z1", &[])));
        assert!(is_insertable(&history, &info("a1", &[])));
        assert!(is_insertable(&History::new(), &info("z1", &[])));
    }
}
