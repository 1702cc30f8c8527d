// projkeeper - integrity ledger, schema migration and preset lifecycle for
// tool-managed build descriptors
//
// This is the library crate containing the core business logic and data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod codec;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use context::KeeperContext;
pub use models::{PresetStatus, SchemaVersion, Settings, StructuredDocument, TreeNode};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
