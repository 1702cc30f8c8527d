use crate::models::MigrationOutcome;
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a preset-managed project.
///
/// - `Absent`: no tool reference found in the project's lists
/// - `NullPlaceholder`: placeholder preset files exist that only hold the sentinel text
/// - `PendingConversion`: a reference exists but presets could not be loaded; waiting
///   for the user to confirm a conversion
/// - `Valid`: presets load and their managed records verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PresetStatus {
    #[default]
    Absent,
    NullPlaceholder,
    PendingConversion,
    Valid,
}

impl fmt::Display for PresetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresetStatus::Absent => "absent",
            PresetStatus::NullPlaceholder => "null-placeholder",
            PresetStatus::PendingConversion => "pending-conversion",
            PresetStatus::Valid => "valid",
        };
        f.write_str(name)
    }
}

/// What the session knows about one tracked project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub folder: Utf8PathBuf,
    pub preset_status: PresetStatus,
    pub last_migration: Option<MigrationOutcome>,
    /// Bumped whenever the project's files were rewritten and downstream caches
    /// (file scanners, indexers) must be refreshed.
    pub cache_generation: u64,
}

impl ProjectRecord {
    pub fn new(folder: impl Into<Utf8PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            preset_status: PresetStatus::default(),
            last_migration: None,
            cache_generation: 0,
        }
    }
}

/// Session-wide state: the tracked projects and the one the user is working on.
///
/// Managed by [`StateManager`](crate::state::StateManager); never mutate it directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub projects: IndexMap<String, ProjectRecord>,
    pub active_project: Option<String>,
}

impl SessionState {
    pub fn project(&self, id: &str) -> Option<&ProjectRecord> {
        self.projects.get(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active_project.as_deref() == Some(id)
    }

    pub fn status_of(&self, id: &str) -> Option<PresetStatus> {
        self.projects.get(id).map(|p| p.preset_status)
    }
}
