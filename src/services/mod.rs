//! Services module - the keeper's business logic.
//!
//! The services are framework-agnostic: no CLI or UI code, every collaborator
//! (user prompt, build tool, settings store) sits behind a trait so it can be
//! replaced in tests.
//!
//! # Components
//!
//! - [`checksum`]: [`ChecksumLedger`] digests, verifies, heals and reseals tool-managed
//!   records in XML and JSON documents
//! - [`journal`]: [`TransactionJournal`] records named commits over a set of documents,
//!   rolls back, and persists atomically with a conversion report
//! - [`migration`]: [`SchemaMigrator`] upgrades project descriptors through ordered,
//!   threshold-guarded steps, including legacy custom build conversion
//! - [`presets`]: [`PresetProject`] runs the preset lifecycle of a CMake-style folder
//! - [`detection`]: finds tool references in CMake list files
//! - [`build`] / [`dispatcher`]: the external build tool and the per-project
//!   deduplicating dispatch loop in front of it
//!
//! # Usage Example
//!
//! ```ignore
//! use projkeeper::services::{MsBuildProject, SchemaMigrator};
//!
//! let migrator = SchemaMigrator::from_settings(&settings);
//! let mut project = MsBuildProject::load("app.vcxproj")?;
//! let outcome = migrator.migrate(&mut project)?;
//! if outcome.commits > 0 {
//!     project.save()?;
//! }
//! ```

pub mod build;
pub mod checksum;
pub mod detection;
pub mod dispatcher;
pub mod journal;
pub mod migration;
pub mod presets;

pub use build::{BuildError, BuildOutcome, BuildRequest, BuildRunner, MsBuildRunner};
pub use checksum::{ChecksumLedger, ChecksumRecord, VENDOR_PREFIX, VerifyResult};
pub use dispatcher::{BuildDispatcher, BuildEvent};
pub use journal::{DocumentId, JournalError, SaveOutcome, Savepoint, TransactionJournal};
pub use migration::{
    MigrationError, MigrationRun, MigrationStep, MsBuildProject, SchemaMigrator, migration_resource,
};
pub use presets::{
    ConversionPrompt, FixedPrompt, PresetError, PresetProject, ProjectEvent, PromptResponse,
};
