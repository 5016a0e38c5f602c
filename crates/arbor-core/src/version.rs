//! Versions - immutable, causally linked edits to an object

use serde::{Deserialize, Serialize};

use crate::{Patch, VersionId};

/// A version as it travels between peers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub id: VersionId,
    pub parents: Vec<VersionId>,
    pub patches: Vec<Patch>,
}

impl VersionInfo {
    pub fn new(id: VersionId, parents: Vec<VersionId>, patches: Vec<Patch>) -> Self {
        VersionInfo {
            id,
            parents,
            patches,
        }
    }

    /// Empty root with the shared genesis id
    pub fn genesis() -> Self {
        VersionInfo {
            id: VersionId::genesis(),
            parents: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Empty-patch version joining `parents`
    pub fn merge(parents: Vec<VersionId>) -> Self {
        VersionInfo {
            id: VersionId::merge_of(&parents),
            parents,
            patches: Vec::new(),
        }
    }
}

/// A version as stored in a history, with its child links
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub parents: Vec<VersionId>,
    /// Sorted, for deterministic enumeration
    pub children: Vec<VersionId>,
    pub patches: Vec<Patch>,
}

impl Version {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Opens more than one branch
    pub fn is_branch(&self) -> bool {
        self.children.len() > 1
    }

    /// Link a child, keeping `children` sorted
    pub fn add_child(&mut self, child: VersionId) {
        if let Err(pos) = self.children.binary_search(&child) {
            self.children.insert(pos, child);
        }
    }

    /// The transmissible part of this version
    pub fn info(&self) -> VersionInfo {
        VersionInfo {
            id: self.id.clone(),
            parents: self.parents.clone(),
            patches: self.patches.clone(),
        }
    }
}

impl From<VersionInfo> for Version {
    fn from(info: VersionInfo) -> Self {
        Version {
            id: info.id,
            parents: info.parents,
            children: Vec::new(),
            patches: info.patches,
        }
    }
}
