//! Synchronized object - base value, version history and ack table

use std::collections::{BTreeSet, HashSet};

use arbor_core::{ArborResult, PeerId, Value, VersionId, VersionInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{find_collapse, materialize, topological_order, AckTable, Collapse, History};

/// One replicated object.
///
/// Replaying `history` onto `base` yields the current value, before and
/// after any collapse.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncObject {
    pub base: Value,
    pub history: History,
    pub peer_acks: AckTable,
}

impl SyncObject {
    /// Create an object with an empty history
    pub fn new(base: Value) -> Self {
        SyncObject {
            base,
            history: History::new(),
            peer_acks: AckTable::new(),
        }
    }

    /// Materialized value
    pub fn view(&self) -> Value {
        materialize(&self.base, &self.history)
    }

    /// Insert a version into the history
    pub fn insert(&mut self, info: VersionInfo) -> ArborResult<bool> {
        self.history.insert(info)
    }

    /// Record that `peer` holds `version`
    pub fn ack(&mut self, peer: &PeerId, version: &VersionId) -> bool {
        self.peer_acks.ack(peer, version)
    }

    /// Versions `peer` has not acked, parents before children
    pub fn unacked_by(&self, peer: &PeerId) -> Vec<VersionInfo> {
        topological_order(&self.history)
            .into_iter()
            .filter(|v| !self.peer_acks.has_acked(peer, &v.id))
            .map(|v| v.info())
            .collect()
    }

    pub fn leaves(&self) -> Vec<VersionId> {
        self.history.leaves()
    }

    /// Join divergent leaves with an empty merge version.
    ///
    /// Returns the merge when one was inserted. The merge becomes `latest`.
    pub fn merge_leaves(&mut self) -> ArborResult<Option<VersionInfo>> {
        let leaves = self.leaves();
        if leaves.len() < 2 {
            return Ok(None);
        }

        let merge = VersionInfo::merge(leaves);
        if !self.history.insert(merge.clone())? {
            return Ok(None);
        }
        self.history.set_latest(merge.id.clone());
        Ok(Some(merge))
    }

    /// Fold a collapse into this object
    pub fn apply_collapse(&mut self, collapse: &Collapse) {
        let removed: HashSet<&VersionId> = collapse.remove_versions.iter().collect();

        self.base = collapse.new_base.clone();
        self.history.root = collapse.new_root.clone();

        for id in &collapse.remove_versions {
            self.history.versions.remove(id);
        }
        for version in self.history.versions.values_mut() {
            version.parents.retain(|p| !removed.contains(p));
        }
        if let Some(root) = &collapse.new_root {
            if let Some(version) = self.history.versions.get_mut(root) {
                version.parents.clear();
            }
        }

        let latest_alive = self
            .history
            .latest
            .as_ref()
            .map(|id| self.history.contains(id))
            .unwrap_or(false);
        if self.history.is_empty() {
            self.history.latest = None;
        } else if !latest_alive {
            self.history.latest = collapse.new_root.clone();
        }

        self.peer_acks.prune(&collapse.remove_versions);
    }

    /// Find and apply the largest collapse for `quorum`
    pub fn collapse(&mut self, quorum: &BTreeSet<PeerId>) -> Option<Collapse> {
        let collapse = find_collapse(self, quorum)?;
        debug!(
            removed = collapse.remove_versions.len(),
            new_root = ?collapse.new_root,
            "collapsing history"
        );
        self.apply_collapse(&collapse);
        Some(collapse)
    }
}
