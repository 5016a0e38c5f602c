//! Version store - the per-object DAG of versions

use std::collections::BTreeMap;

use arbor_core::{ArborError, ArborResult, Version, VersionId, VersionInfo};
use serde::{Deserialize, Serialize};

/// Version DAG of one object, kept as an arena keyed by id
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Entry point of every traversal
    pub root: Option<VersionId>,
    /// Parent of the next local edit
    pub latest: Option<VersionId>,
    /// All live versions
    pub versions: BTreeMap<VersionId, Version>,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    /// Get a version by ID
    pub fn get(&self, id: &VersionId) -> Option<&Version> {
        self.versions.get(id)
    }

    /// Check if a version exists
    pub fn contains(&self, id: &VersionId) -> bool {
        self.versions.contains_key(id)
    }

    /// Get number of versions
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// All version ids, sorted
    pub fn ids(&self) -> Vec<VersionId> {
        self.versions.keys().cloned().collect()
    }

    /// Versions without children, sorted by id
    pub fn leaves(&self) -> Vec<VersionId> {
        self.versions
            .values()
            .filter(|v| v.is_leaf())
            .map(|v| v.id.clone())
            .collect()
    }

    pub fn set_latest(&mut self, id: VersionId) {
        self.latest = Some(id);
    }

    /// Insert a version.
    ///
    /// Returns `Ok(false)` when the id is already present. On error the
    /// history is left unchanged.
    pub fn insert(&mut self, info: VersionInfo) -> ArborResult<bool> {
        if self.versions.contains_key(&info.id) {
            return Ok(false);
        }

        if info.parents.is_empty() {
            if !self.versions.is_empty() {
                return Err(ArborError::SecondRoot {
                    version: info.id,
                    root: self.root.clone(),
                });
            }
            self.root = Some(info.id.clone());
            self.latest = Some(info.id.clone());
            self.versions.insert(info.id.clone(), Version::from(info));
            return Ok(true);
        }

        if self.root.is_none() {
            return Err(ArborError::Unrooted { version: info.id });
        }

        if let Some(missing) = info.parents.iter().find(|p| !self.versions.contains_key(*p)) {
            return Err(ArborError::MissingParent {
                version: info.id.clone(),
                parent: missing.clone(),
                known: self.ids(),
            });
        }

        for parent in &info.parents {
            if let Some(version) = self.versions.get_mut(parent) {
                version.add_child(info.id.clone());
            }
        }
        self.versions.insert(info.id.clone(), Version::from(info));
        Ok(true)
    }
}
