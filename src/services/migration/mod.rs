//! Transactional upgrade of project descriptors to the current format version.
//!
//! [`SchemaMigrator::migrate`] runs an ordered list of [`MigrationStep`]s against an
//! [`MsBuildProject`]. A step runs iff the project's original version is below the
//! step's threshold; every sub-edit is committed to the project's journal with a
//! descriptive message. If any step fails, the journal is rolled back to the state
//! before the first step and no commit from the run survives.
//!
//! [`SchemaMigrator::migrate_path`] is the entry point for files on disk: it holds the
//! project's named migration resource from load to save, so two migrations of the
//! same project never interleave.

pub mod custom_build;
pub mod modules;
pub mod project;
pub mod steps;

pub use custom_build::{ParsedCommand, ToolKind, parse_command};
pub use modules::{ModuleUsage, ToolModule, ToolSettings, catalog};
pub use project::{MsBuildProject, ProjectConfiguration};
pub use steps::StepResult;

use crate::context::KeeperContext;
use crate::models::{DocumentError, MigrationOutcome, SchemaVersion, Settings, SettingsStore};
use crate::services::journal::{JournalError, SaveOutcome};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Load(#[from] DocumentError),

    #[error("Unsupported project format version: {0}")]
    UnsupportedVersion(SchemaVersion),

    #[error("{path}: migration step '{step}' could not find {anchor}")]
    AnchorNotFound {
        path: Utf8PathBuf,
        step: &'static str,
        anchor: String,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("{0}: another migration of this project did not finish in time")]
    Busy(Utf8PathBuf),
}

const MIGRATE: &str = "Migrate";

/// Name of the resource serializing migrations of the project at `path`.
pub fn migration_resource(path: &Utf8Path) -> String {
    format!("{}/{}", path, MIGRATE)
}

/// Result of [`SchemaMigrator::migrate_path`].
#[derive(Debug)]
pub struct MigrationRun {
    pub outcome: MigrationOutcome,
    pub commit_messages: Vec<String>,
    /// None for a dry run
    pub saved: Option<SaveOutcome>,
}

pub type StepFn = fn(&SchemaMigrator, &mut MsBuildProject) -> StepResult;

/// One transformation, run for projects older than `threshold`.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub threshold: SchemaVersion,
    pub name: &'static str,
    pub run: StepFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("threshold", &self.threshold)
            .field("name", &self.name)
            .finish()
    }
}

fn default_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            threshold: SchemaVersion::V3,
            name: "legacy upgrade",
            run: steps::upgrade_legacy,
        },
        MigrationStep {
            threshold: SchemaVersion::V3_CL_PROPERTIES,
            name: "relocate tool settings",
            run: steps::relocate_tool_settings,
        },
        MigrationStep {
            threshold: SchemaVersion::V3_GLOBAL_TOOL_PATH,
            name: "global tool path",
            run: steps::move_tool_path_to_globals,
        },
        MigrationStep {
            threshold: SchemaVersion::V3_PROPERTY_EVAL,
            name: "populate configuration groups",
            run: steps::populate_configuration_groups,
        },
        MigrationStep {
            threshold: SchemaVersion::LATEST,
            name: "convert custom builds",
            run: custom_build::convert_custom_builds,
        },
    ]
}

/// Upgrades project descriptors to [`SchemaVersion::LATEST`].
pub struct SchemaMigrator {
    settings: Arc<dyn SettingsStore>,
    default_tool_version: Option<String>,
    steps: Vec<MigrationStep>,
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("default_tool_version", &self.default_tool_version)
            .field("steps", &self.steps)
            .finish()
    }
}

impl SchemaMigrator {
    pub fn new(settings: Arc<dyn SettingsStore>, default_tool_version: Option<String>) -> Self {
        Self {
            settings,
            default_tool_version,
            steps: default_steps(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(settings.clone()),
            settings.conversion.default_tool_version.clone(),
        )
    }

    /// Add a step, keeping steps ordered by threshold. Steps with equal thresholds
    /// run in the order they were added.
    pub fn with_step(mut self, step: MigrationStep) -> Self {
        let index = self
            .steps
            .iter()
            .position(|s| s.threshold > step.threshold)
            .unwrap_or(self.steps.len());
        self.steps.insert(index, step);
        self
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Read-only tool settings (generated-files directory overrides).
    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    pub fn default_tool_version(&self) -> Option<&str> {
        self.default_tool_version.as_deref()
    }

    /// Load, migrate and (unless `dry_run`) save the project at `path` while holding
    /// its migration resource.
    ///
    /// The project is loaded after the resource is acquired, so a migration queued
    /// behind another one sees the files that one saved. The outcome is recorded in
    /// the context's metrics and session state.
    pub async fn migrate_path(
        &self,
        context: &Arc<KeeperContext>,
        path: &Utf8Path,
        dry_run: bool,
    ) -> Result<MigrationRun, MigrationError> {
        let resource = migration_resource(path);
        let Some(_lease) = context.resources.lease(&resource, None).await else {
            return Err(MigrationError::Busy(path.to_owned()));
        };

        let mut project = MsBuildProject::load(path)?;
        let id = path.as_str();
        context
            .state
            .track_project(id, path.parent().unwrap_or(Utf8Path::new(".")));

        let outcome = match self.migrate(&mut project) {
            Ok(outcome) => outcome,
            Err(e) => {
                context.metrics.record_migration_failed();
                return Err(e);
            }
        };
        context
            .metrics
            .record_migration(outcome.commits, outcome.issues.len());
        context.state.record_migration(id, outcome.clone());

        let commit_messages = project
            .journal()
            .commits()
            .iter()
            .map(|c| c.message.clone())
            .collect();
        let saved = if dry_run {
            None
        } else {
            Some(project.save()?)
        };
        Ok(MigrationRun {
            outcome,
            commit_messages,
            saved,
        })
    }

    /// Upgrade `project` in memory. Nothing is written to disk; call
    /// [`MsBuildProject::save`] afterwards.
    ///
    /// # Returns
    /// The outcome, with per-item conversion issues. On error every edit made by
    /// this call has been rolled back.
    pub fn migrate(&self, project: &mut MsBuildProject) -> Result<MigrationOutcome, MigrationError> {
        let from = project.format_version();
        if from == SchemaVersion::LATEST {
            tracing::info!("{}: already at format {}", project.path(), from);
            return Ok(MigrationOutcome {
                from,
                to: from,
                commits: 0,
                issues: Vec::new(),
            });
        }
        if !from.is_known() {
            tracing::error!("{}: unsupported format version {}", project.path(), from);
            return Err(MigrationError::UnsupportedVersion(from));
        }

        tracing::info!(
            "{}: migrating from format {} to {}",
            project.path(),
            from,
            SchemaVersion::LATEST
        );
        let savepoint = project.journal().savepoint();
        let commits_before = project.journal().commits().len();
        let mut issues = Vec::new();

        for step in self.steps.iter().filter(|s| from < s.threshold) {
            tracing::debug!("{}: running step '{}'", project.path(), step.name);
            match (step.run)(self, project) {
                Ok(step_issues) => issues.extend(step_issues),
                Err(e) => {
                    tracing::error!("{}: step '{}' failed: {}", project.path(), step.name, e);
                    project.journal_mut().rollback_to(&savepoint);
                    return Err(e);
                }
            }
        }

        if !project.set_format_version(SchemaVersion::LATEST) {
            let error = MigrationError::AnchorNotFound {
                path: project.path().to_owned(),
                step: "set format version",
                anchor: "Keyword".to_string(),
            };
            project.journal_mut().rollback_to(&savepoint);
            return Err(error);
        }
        project.commit("Setting project format version");

        let commits = project.journal().commits().len() - commits_before;
        if issues.is_empty() {
            tracing::info!("{}: migrated with {} commit(s)", project.path(), commits);
        } else {
            tracing::warn!(
                "{}: migrated with {} commit(s) and {} unconverted item(s)",
                project.path(),
                commits,
                issues.len()
            );
        }
        Ok(MigrationOutcome {
            from,
            to: SchemaVersion::LATEST,
            commits,
            issues,
        })
    }
}
