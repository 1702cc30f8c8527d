// State management module
//
// This module provides the StateManager which wraps SessionState with thread-safe access
// using Arc<RwLock<T>> and emits change events for interested components.

use crate::models::{MigrationOutcome, PresetStatus, ProjectRecord, SessionState};
use camino::Utf8PathBuf;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Change events emitted when session state is modified
///
/// These events let listeners (the CLI, dispatchers, tests) react to project
/// lifecycle changes without polling the state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A project is now tracked by the session
    ProjectTracked { id: String, folder: Utf8PathBuf },

    /// A project is no longer tracked
    ProjectRemoved { id: String },

    /// The preset lifecycle of a project moved to a new status
    PresetStatusChanged {
        id: String,
        from: PresetStatus,
        to: PresetStatus,
    },

    /// A schema migration finished (successfully or with conversion issues)
    MigrationCompleted {
        id: String,
        commits: usize,
        issues: usize,
    },

    /// The project the user works on changed
    ActiveProjectChanged { id: Option<String> },

    /// Files of a project were rewritten; downstream caches must be refreshed
    CacheInvalidated { id: String, generation: u64 },

    /// State has been reset
    StateReset,
}

/// Thread-safe session state manager with event emission
///
/// This is the central state management component that:
/// - Provides thread-safe access to [`SessionState`] via `Arc<RwLock<T>>`
/// - Detects state changes and emits [`StateChange`] events
/// - Supports subscribing to state changes via tokio broadcast channels
///
/// # Usage
///
/// Always use `StateManager` instead of accessing [`SessionState`] directly:
/// - [`read()`](Self::read) for reading state under the lock
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - [`subscribe()`](Self::subscribe) for listening to state changes
///
/// # Related Types
///
/// - [`crate::models::SessionState`]: The underlying state structure
/// - [`StateChange`]: Event types emitted on state mutations
/// - [`crate::services::presets::PresetProject`]: Publishes preset status changes
pub struct StateManager {
    /// The session state protected by RwLock for thread-safe access
    state: Arc<RwLock<SessionState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with empty state
    ///
    /// # Returns
    /// A new StateManager with a broadcast channel buffer of 100 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            state_tx,
        }
    }

    /// Get a clone of the current state
    pub fn snapshot(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let active = state_manager.read(|state| state.active_project.clone());
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SessionState) -> R,
    {
        let state = self.state.read();
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// This is the primary way to modify state. It:
    /// 1. Captures the old state
    /// 2. Applies the update function
    /// 3. Detects what changed
    /// 4. Emits appropriate events
    ///
    /// # Returns
    /// A vector of StateChange events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut SessionState),
    {
        let mut state = self.state.write();
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);
        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }
        changes
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(old: &SessionState, new: &SessionState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        for (id, record) in &new.projects {
            match old.projects.get(id) {
                None => changes.push(StateChange::ProjectTracked {
                    id: id.clone(),
                    folder: record.folder.clone(),
                }),
                Some(previous) => {
                    if previous.preset_status != record.preset_status {
                        changes.push(StateChange::PresetStatusChanged {
                            id: id.clone(),
                            from: previous.preset_status,
                            to: record.preset_status,
                        });
                    }
                    if previous.cache_generation != record.cache_generation {
                        changes.push(StateChange::CacheInvalidated {
                            id: id.clone(),
                            generation: record.cache_generation,
                        });
                    }
                    if previous.last_migration != record.last_migration {
                        if let Some(outcome) = &record.last_migration {
                            changes.push(StateChange::MigrationCompleted {
                                id: id.clone(),
                                commits: outcome.commits,
                                issues: outcome.issues.len(),
                            });
                        }
                    }
                }
            }
        }
        for id in old.projects.keys() {
            if !new.projects.contains_key(id) {
                changes.push(StateChange::ProjectRemoved { id: id.clone() });
            }
        }

        if old.active_project != new.active_project {
            changes.push(StateChange::ActiveProjectChanged {
                id: new.active_project.clone(),
            });
        }

        changes
    }

    // Convenience methods for common state updates

    /// Start tracking a project; no-op if it is already tracked
    pub fn track_project(&self, id: &str, folder: impl Into<Utf8PathBuf>) -> Vec<StateChange> {
        let folder = folder.into();
        self.update(|state| {
            state
                .projects
                .entry(id.to_string())
                .or_insert_with(|| ProjectRecord::new(folder));
        })
    }

    pub fn remove_project(&self, id: &str) -> Vec<StateChange> {
        self.update(|state| {
            state.projects.shift_remove(id);
            if state.active_project.as_deref() == Some(id) {
                state.active_project = None;
            }
        })
    }

    /// Make `id` the project whose triggers are processed
    pub fn set_active_project(&self, id: Option<&str>) -> Vec<StateChange> {
        self.update(|state| {
            state.active_project = id.map(str::to_string);
        })
    }

    pub fn set_preset_status(&self, id: &str, status: PresetStatus) -> Vec<StateChange> {
        self.update(|state| {
            if let Some(record) = state.projects.get_mut(id) {
                record.preset_status = status;
            }
        })
    }

    pub fn record_migration(&self, id: &str, outcome: MigrationOutcome) -> Vec<StateChange> {
        self.update(|state| {
            if let Some(record) = state.projects.get_mut(id) {
                record.last_migration = Some(outcome);
            }
        })
    }

    /// Bump the cache generation of a project
    pub fn invalidate_cache(&self, id: &str) -> Vec<StateChange> {
        self.update(|state| {
            if let Some(record) = state.projects.get_mut(id) {
                record.cache_generation += 1;
            }
        })
    }

    /// Forget every tracked project
    pub fn reset(&self) -> Vec<StateChange> {
        let mut changes = self.update(|state| {
            *state = SessionState::default();
        });

        let reset_event = StateChange::StateReset;
        let _ = self.state_tx.send(reset_event.clone());
        changes.push(reset_event);

        changes
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across tasks
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}
