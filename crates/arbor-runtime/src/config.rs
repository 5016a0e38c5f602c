//! Runtime configuration

use arbor_state::DEFAULT_PENDING_CAPACITY;
use arbor_topology::RelayRole;

/// Peer configuration
///
/// History collapse defaults to the settled rule: a version only folds once
/// every known peer has acked one of its children. That is less than the
/// maximal collapse, so the last acked version always stays in history. Use
/// [`PeerConfig::with_settled_collapse`] with `false` for the maximal rule.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Relay role of this peer's links
    pub role: RelayRole,
    /// Maximum parked versions per object
    pub max_pending_versions: usize,
    /// Collapse fully acknowledged history
    pub collapse_history: bool,
    /// Only fold versions every known peer has already built past, which
    /// keeps the last version live and lets concurrent edits land safely
    pub settled_collapse: bool,
    /// Seed for version id generation; entropy when unset
    pub rng_seed: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            role: RelayRole::Leaf,
            max_pending_versions: DEFAULT_PENDING_CAPACITY,
            collapse_history: true,
            settled_collapse: true,
            rng_seed: None,
        }
    }
}

impl PeerConfig {
    /// Default configuration for a relaying hub
    pub fn hub() -> Self {
        PeerConfig::default().with_role(RelayRole::Hub)
    }

    pub fn with_role(mut self, role: RelayRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_max_pending_versions(mut self, max: usize) -> Self {
        self.max_pending_versions = max;
        self
    }

    pub fn with_collapse_history(mut self, enabled: bool) -> Self {
        self.collapse_history = enabled;
        self
    }

    pub fn with_settled_collapse(mut self, settled: bool) -> Self {
        self.settled_collapse = settled;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Logging configuration
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub default_directive: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            default_directive: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}
