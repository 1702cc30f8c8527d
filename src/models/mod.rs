//! Data models shared across the crate.
//!
//! - [`TreeNode`] / [`NodePath`]: the format-neutral document tree
//! - [`StructuredDocument`]: a descriptor file with working, committed and saved trees
//! - [`SchemaVersion`]: ordered project format versions
//! - [`FileChange`], [`MigrationCommit`], [`ConversionReport`]: journal records
//! - [`SessionState`] / [`PresetStatus`]: per-session project tracking
//! - [`Settings`]: YAML-backed application settings

pub mod document;
pub mod report;
pub mod session;
pub mod settings;
pub mod tree;
pub mod version;

pub use document::{DocumentError, StructuredDocument};
pub use report::{
    ConversionIssue, ConversionReport, FileChange, MigrationCommit, MigrationOutcome,
};
pub use session::{PresetStatus, ProjectRecord, SessionState};
pub use settings::{
    ConversionSettings, DispatchSettings, LoggingSettings, ResourceSettings, Settings,
    SettingsStore,
};
pub use tree::{NodeKind, NodePath, ScalarType, TreeNode};
pub use version::SchemaVersion;
