//! Preset lifecycle of CMake-style project folders.
//!
//! A [`PresetProject`] tracks one folder holding `CMakeLists.txt` (plus `*.cmake`
//! includes), the shared `CMakePresets.json` and the per-user
//! `CMakeUserPresets.json`. Every trigger runs a two-pass state machine: the first
//! pass moves the [`PresetStatus`] according to what is on disk, the second runs
//! the action belonging to the new status. Only a `Valid` project has its managed
//! preset records healed, regenerated and resealed.

use crate::codec::TextLayout;
use crate::concurrency::CriticalSection;
use crate::context::KeeperContext;
use crate::models::{DocumentError, NodeKind, PresetStatus, ScalarType, StructuredDocument, TreeNode};
use crate::services::checksum::ChecksumLedger;
use crate::services::detection;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PRESETS_FILE: &str = "CMakePresets.json";
pub const USER_PRESETS_FILE: &str = "CMakeUserPresets.json";

/// Placeholder written by tools that need a preset file to exist before the
/// project is configured. Compared after trimming surrounding whitespace.
pub const NULL_PRESETS_TEXT: &str =
    r#"{ "version": 3, "configurePresets": [ { "name": "(null)", "hidden": true } ] }"#;

const PRESETS_RECORD: &str = "qt-project.org/Presets";
const QT_RECORD: &str = "qt-project.org/Qt";
const VERSION_RECORD: &str = "qt-project.org/Version";
const DEFAULT_RECORD: &str = "qt-project.org/Default";

const BASE_PRESET: &str = "Qt";
const DEFAULT_PRESET: &str = "Qt-Default";
const PRESETS_FORMAT_VERSION: &str = "3";

const CHECK_STATUS: &str = "CheckStatus";

/// Variables that mark a configure preset as already pointing at a tool install.
const TOOL_VARIABLES: &[&str] = &["QTDIR", "Qt5_DIR", "Qt6_DIR"];

#[derive(Debug, Error)]
pub enum PresetError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("{path}: presets root is not a JSON object")]
    NotAnObject { path: Utf8PathBuf },

    #[error("{path}: presets carry no {PRESETS_RECORD} record")]
    Unmanaged { path: Utf8PathBuf },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Answer of the user interface to a conversion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptResponse {
    Confirmed,
    Dismissed,
    /// Dismissed, and do not ask again for this project during the session.
    Suppressed,
}

/// User interface collaborator asked before a project is converted.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversionPrompt: Send + Sync {
    async fn request_conversion_confirmation(&self, project: &str) -> PromptResponse;
}

/// Prompt that always gives the same answer (non-interactive front ends).
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub PromptResponse);

#[async_trait]
impl ConversionPrompt for FixedPrompt {
    async fn request_conversion_confirmation(&self, project: &str) -> PromptResponse {
        tracing::info!("{}: conversion request answered with {:?}", project, self.0);
        self.0
    }
}

/// Triggers that re-evaluate a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    /// A file changed on disk; ignored unless it is one of the project's files.
    FileChanged { path: Utf8PathBuf },
    /// The file scanner or indexer finished a pass over the folder.
    ScanCompleted,
    CheckRequested,
}

/// Whether `path` holds only the placeholder text.
pub fn is_null_presets(path: &Utf8Path) -> bool {
    fs::read_to_string(path).is_ok_and(|text| text.trim() == NULL_PRESETS_TEXT)
}

fn preset_name(preset: &TreeNode) -> &str {
    preset.child("name").map(TreeNode::value).unwrap_or_default()
}

fn bool_member(name: &str, value: bool) -> TreeNode {
    TreeNode::scalar(name, ScalarType::Bool, Some(value.to_string()))
}

/// Value of a cache variable, which is either a plain scalar or `{ "value": ... }`.
fn variable_value(variable: &TreeNode) -> &str {
    match variable.kind {
        NodeKind::Object => variable.child("value").map(TreeNode::value).unwrap_or_default(),
        _ => variable.value(),
    }
}

/// Whether a configure preset already points at a tool install.
fn references_tool(preset: &TreeNode) -> bool {
    ["cacheVariables", "environment"]
        .iter()
        .filter_map(|section| preset.child(section))
        .flat_map(|section| section.children.iter())
        .any(|variable| match variable.name.as_str() {
            "CMAKE_PREFIX_PATH" => variable_value(variable).contains("Qt"),
            name => TOOL_VARIABLES.contains(&name),
        })
}

/// Make sure `root` has a `configurePresets` array and return it.
fn configure_presets(root: &mut TreeNode) -> &mut TreeNode {
    if !root
        .child("configurePresets")
        .is_some_and(|presets| presets.kind == NodeKind::Array)
    {
        root.set_member(TreeNode::array("configurePresets"));
    }
    let index = root
        .position(|c| c.name == "configurePresets")
        .unwrap_or_default();
    &mut root.children[index]
}

fn ensure_format_version(root: &mut TreeNode) {
    if root.child("version").is_none() {
        root.children.insert(
            0,
            TreeNode::scalar(
                "version",
                ScalarType::Number,
                Some(PRESETS_FORMAT_VERSION.to_string()),
            ),
        );
    }
}

/// One CMake-style project folder and its preset lifecycle.
pub struct PresetProject {
    id: String,
    folder: Utf8PathBuf,
    context: Arc<KeeperContext>,
    prompt: Arc<dyn ConversionPrompt>,
    ledger: ChecksumLedger,
    section: CriticalSection,
    status: Mutex<PresetStatus>,
    suppressed: AtomicBool,
}

impl PresetProject {
    /// Start tracking `folder` under `id`.
    ///
    /// The initial status is `NullPlaceholder` if either preset file holds only
    /// the placeholder text, `Absent` otherwise.
    pub fn new(
        id: impl Into<String>,
        folder: impl Into<Utf8PathBuf>,
        context: Arc<KeeperContext>,
        prompt: Arc<dyn ConversionPrompt>,
    ) -> Self {
        let id = id.into();
        let folder = folder.into();
        let status = if is_null_presets(&folder.join(PRESETS_FILE))
            || is_null_presets(&folder.join(USER_PRESETS_FILE))
        {
            PresetStatus::NullPlaceholder
        } else {
            PresetStatus::Absent
        };

        context.state.track_project(&id, folder.clone());
        context.state.set_preset_status(&id, status);
        tracing::debug!("{}: tracking {} ({})", id, folder, status);

        Self {
            id,
            folder,
            context,
            prompt,
            ledger: ChecksumLedger::default(),
            section: CriticalSection::new(),
            status: Mutex::new(status),
            suppressed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn folder(&self) -> &Utf8Path {
        &self.folder
    }

    pub fn status(&self) -> PresetStatus {
        *self.status.lock()
    }

    pub fn presets_path(&self) -> Utf8PathBuf {
        self.folder.join(PRESETS_FILE)
    }

    pub fn user_presets_path(&self) -> Utf8PathBuf {
        self.folder.join(USER_PRESETS_FILE)
    }

    /// Whether a change to `path` can affect this project's status.
    pub fn is_project_file(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.folder)
            && (detection::is_list_file(path)
                || path
                    .file_name()
                    .is_some_and(|name| name == PRESETS_FILE || name == USER_PRESETS_FILE))
    }

    fn set_status(&self, status: PresetStatus) {
        let previous = std::mem::replace(&mut *self.status.lock(), status);
        if previous != status {
            tracing::info!("{}: preset status {} -> {}", self.id, previous, status);
            self.context.state.set_preset_status(&self.id, status);
        }
    }

    fn resource_name(&self) -> String {
        format!("{}/{}", self.id, CHECK_STATUS)
    }

    /// Re-evaluate the project.
    ///
    /// Serialized per project through a named resource. Skipped unless this is
    /// the session's active project. Failures are logged, never returned.
    pub async fn check_status(&self) {
        let resource = self.resource_name();
        let timeout = self.context.settings.resources.acquire_timeout();
        let Some(_lease) = self.context.resources.lease(&resource, Some(timeout)).await else {
            tracing::warn!("{}: timed out waiting for {}", self.id, resource);
            return;
        };

        if !self.context.state.read(|state| state.is_active(&self.id)) {
            tracing::debug!("{}: not the active project, check skipped", self.id);
            return;
        }

        if let Err(e) = self.run_state_machine().await {
            tracing::error!("{}: preset check failed: {}", self.id, e);
        }
    }

    async fn run_state_machine(&self) -> Result<(), PresetError> {
        let lists = detection::list_files(&self.folder);
        let has_reference = detection::has_tool_reference(&lists);

        let mut status = self.status();
        match status {
            PresetStatus::Absent | PresetStatus::NullPlaceholder => {
                if has_reference {
                    status = if self.try_load_presets() {
                        PresetStatus::Valid
                    } else {
                        PresetStatus::PendingConversion
                    };
                }
            }
            PresetStatus::PendingConversion => return Ok(()),
            PresetStatus::Valid => {
                if !has_reference {
                    status = PresetStatus::Absent;
                } else if !self.try_load_presets() {
                    status = PresetStatus::PendingConversion;
                }
            }
        }

        match status {
            PresetStatus::Absent => {
                self.set_status(PresetStatus::Absent);
                return Ok(());
            }
            PresetStatus::NullPlaceholder => {
                self.delete_null_presets();
                self.set_status(PresetStatus::Absent);
                return Ok(());
            }
            PresetStatus::PendingConversion => {
                if !self.is_auto_convertible() {
                    self.set_status(PresetStatus::PendingConversion);
                    return self.request_confirmation().await;
                }
                tracing::info!("{}: converting presets without confirmation", self.id);
            }
            PresetStatus::Valid => {}
        }

        self.refresh()?;
        self.set_status(PresetStatus::Valid);
        Ok(())
    }

    fn delete_null_presets(&self) {
        for path in [self.presets_path(), self.user_presets_path()] {
            if !is_null_presets(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::info!("{}: removed placeholder {}", self.id, path),
                Err(e) => tracing::warn!("{}: cannot remove {}: {}", self.id, path, e),
            }
        }
    }

    async fn request_confirmation(&self) -> Result<(), PresetError> {
        if !self.context.settings.conversion.notify || self.suppressed.load(Ordering::Acquire) {
            tracing::info!("{}: conversion pending, confirmation suppressed", self.id);
            return Ok(());
        }

        match self.prompt.request_conversion_confirmation(&self.id).await {
            PromptResponse::Confirmed => self.convert_confirmed().map(|_| ()),
            PromptResponse::Dismissed => {
                tracing::info!("{}: conversion dismissed", self.id);
                Ok(())
            }
            PromptResponse::Suppressed => {
                tracing::info!("{}: conversion dismissed for this session", self.id);
                self.suppressed.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Convert a project waiting for confirmation.
    ///
    /// # Returns
    /// false if the project was not pending conversion
    pub async fn confirm_conversion(&self) -> Result<bool, PresetError> {
        let resource = self.resource_name();
        let timeout = self.context.settings.resources.acquire_timeout();
        let Some(_lease) = self.context.resources.lease(&resource, Some(timeout)).await else {
            tracing::warn!("{}: timed out waiting for {}", self.id, resource);
            return Ok(false);
        };
        self.convert_confirmed()
    }

    fn convert_confirmed(&self) -> Result<bool, PresetError> {
        let converted = self.section.atomic(
            || self.status() == PresetStatus::PendingConversion,
            || self.set_status(PresetStatus::Valid),
            || tracing::debug!("{}: no conversion pending", self.id),
        );
        if converted {
            self.refresh()?;
        }
        Ok(converted)
    }

    fn try_load_presets(&self) -> bool {
        match self.load_presets() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("{}: presets not loadable: {}", self.id, e);
                false
            }
        }
    }

    /// The base file must exist and be managed; the user file may be missing but
    /// must parse when present.
    fn load_presets(&self) -> Result<(), PresetError> {
        let base = StructuredDocument::load(self.presets_path())?;
        if base.root().kind != NodeKind::Object {
            return Err(PresetError::NotAnObject {
                path: base.path().to_owned(),
            });
        }
        if self.ledger.record_type(base.root()) != Some(PRESETS_RECORD) {
            return Err(PresetError::Unmanaged {
                path: base.path().to_owned(),
            });
        }

        let user_path = self.user_presets_path();
        if user_path.exists() {
            let user = StructuredDocument::load(&user_path)?;
            if user.root().kind != NodeKind::Object {
                return Err(PresetError::NotAnObject { path: user_path });
            }
        }
        Ok(())
    }

    /// Whether the base presets can be taken over without asking: they parse and
    /// a configure preset already points at a tool install.
    pub fn is_auto_convertible(&self) -> bool {
        let Ok(base) = StructuredDocument::load(self.presets_path()) else {
            return false;
        };
        base.root()
            .child("configurePresets")
            .is_some_and(|presets| presets.children.iter().any(references_tool))
    }

    fn load_or_create(&self, path: Utf8PathBuf) -> Result<StructuredDocument, PresetError> {
        if path.exists() {
            let doc = StructuredDocument::load(&path)?;
            if doc.root().kind != NodeKind::Object {
                return Err(PresetError::NotAnObject { path });
            }
            return Ok(doc);
        }
        let layout = TextLayout {
            trailing_newline: true,
            ..TextLayout::default()
        };
        Ok(StructuredDocument::new(path, TreeNode::object(""), layout))
    }

    /// Heal, regenerate and reseal the managed records of both preset files.
    ///
    /// Only files whose text changed are written. Any write bumps the project's
    /// cache generation.
    ///
    /// # Returns
    /// true if a file was written
    pub(crate) fn refresh(&self) -> Result<bool, PresetError> {
        let mut base = self.load_or_create(self.presets_path())?;
        let mut user = self.load_or_create(self.user_presets_path())?;

        if !self.ledger.verify_and_heal(&mut [&mut base, &mut user]) {
            self.context.metrics.record_checksum_heal();
        }

        self.ensure_base_records(base.root_mut());
        self.ensure_user_records(user.root_mut());

        let resealed = self.ledger.reseal(&mut base) + self.ledger.reseal(&mut user);
        if resealed > 0 {
            self.context.metrics.record_reseals(resealed);
        }

        let mut written = false;
        for doc in [&mut base, &mut user] {
            if !doc.needs_save() {
                continue;
            }
            doc.save().map_err(|source| PresetError::Write {
                path: doc.path().to_owned(),
                source,
            })?;
            tracing::info!("{}: wrote {}", self.id, doc.path());
            written = true;
        }

        if written {
            self.context.state.invalidate_cache(&self.id);
        }
        Ok(written)
    }

    /// Root record and the hidden base preset every version preset inherits.
    fn ensure_base_records(&self, root: &mut TreeNode) {
        ensure_format_version(root);

        let presets = configure_presets(root);
        if !presets
            .children
            .iter()
            .any(|p| self.ledger.record_type(p) == Some(QT_RECORD))
        {
            let mut preset = TreeNode::object("")
                .with_child(TreeNode::string("name", BASE_PRESET))
                .with_child(bool_member("hidden", true))
                .with_child(
                    TreeNode::object("cacheVariables")
                        .with_child(TreeNode::string("CMAKE_PREFIX_PATH", "$env{QTDIR}")),
                );
            self.ledger.stamp(&mut preset, QT_RECORD);
            presets.children.insert(0, preset);
            tracing::debug!("{}: added base preset '{}'", self.id, BASE_PRESET);
        }

        if !self.ledger.is_managed(root) {
            self.ledger.stamp(root, PRESETS_RECORD);
        }
    }

    /// Root record, one hidden preset per known tool version and the default
    /// preset pointing at the preferred version.
    fn ensure_user_records(&self, root: &mut TreeNode) {
        let versions = &self.context.settings.tool_versions;
        ensure_format_version(root);

        let presets = configure_presets(root);
        let stale = presets.remove_children(|p| {
            self.ledger.record_type(p) == Some(VERSION_RECORD)
                && !versions.contains_key(preset_name(p))
        });
        for preset in &stale {
            tracing::info!(
                "{}: removed preset of unknown version '{}'",
                self.id,
                preset_name(preset)
            );
        }

        for (version, install_dir) in versions {
            let existing = presets.children.iter_mut().find(|p| {
                self.ledger.record_type(p) == Some(VERSION_RECORD) && preset_name(p) == version.as_str()
            });
            match existing {
                Some(preset) => {
                    let current = preset
                        .child("environment")
                        .and_then(|env| env.child("QTDIR"))
                        .map(TreeNode::value);
                    if current != Some(install_dir.as_str()) {
                        let qtdir = TreeNode::string("QTDIR", install_dir);
                        match preset.child_mut("environment") {
                            Some(env) if env.kind == NodeKind::Object => env.set_member(qtdir),
                            _ => preset.set_member(TreeNode::object("environment").with_child(qtdir)),
                        }
                        tracing::debug!("{}: updated install dir of '{}'", self.id, version);
                    }
                }
                None => {
                    let mut preset = TreeNode::object("")
                        .with_child(TreeNode::string("name", version))
                        .with_child(bool_member("hidden", true))
                        .with_child(TreeNode::string("inherits", BASE_PRESET))
                        .with_child(
                            TreeNode::object("environment")
                                .with_child(TreeNode::string("QTDIR", install_dir)),
                        );
                    self.ledger.stamp(&mut preset, VERSION_RECORD);
                    presets.children.push(preset);
                    tracing::debug!("{}: added preset for version '{}'", self.id, version);
                }
            }
        }

        let preferred = self
            .context
            .settings
            .conversion
            .default_tool_version
            .as_deref()
            .filter(|v| versions.contains_key(*v))
            .or_else(|| versions.keys().next().map(String::as_str));
        let existing = presets.position(|p| self.ledger.record_type(p) == Some(DEFAULT_RECORD));
        match (preferred, existing) {
            (None, Some(index)) => {
                presets.children.remove(index);
            }
            (None, None) => {}
            (Some(version), Some(index)) => {
                let preset = &mut presets.children[index];
                if preset.child("inherits").map(TreeNode::value) != Some(version) {
                    preset.set_member(TreeNode::string("inherits", version));
                }
            }
            (Some(version), None) => {
                let mut preset = TreeNode::object("")
                    .with_child(TreeNode::string("name", DEFAULT_PRESET))
                    .with_child(bool_member("hidden", true))
                    .with_child(TreeNode::string("inherits", version));
                self.ledger.stamp(&mut preset, DEFAULT_RECORD);
                presets.children.push(preset);
            }
        }

        if !self.ledger.is_managed(root) {
            self.ledger.stamp(root, PRESETS_RECORD);
        }
    }

    pub async fn handle_event(&self, event: ProjectEvent) {
        match event {
            ProjectEvent::FileChanged { path } => {
                if self.is_project_file(&path) {
                    self.check_status().await;
                } else {
                    tracing::trace!("{}: ignoring change to {}", self.id, path);
                }
            }
            ProjectEvent::ScanCompleted | ProjectEvent::CheckRequested => {
                self.check_status().await;
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ProjectEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("{}: event loop stopped", self.id);
    }
}

impl std::fmt::Debug for PresetProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetProject")
            .field("id", &self.id)
            .field("folder", &self.folder)
            .field("status", &self.status())
            .finish()
    }
}
