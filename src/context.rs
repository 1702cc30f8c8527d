//! Process-wide context shared by every component.
//!
//! There are no global singletons: the binary (or a test) builds one
//! [`KeeperContext`] and hands it to the services that need settings, named
//! resources, session state or metrics.

use crate::concurrency::ResourceRegistry;
use crate::metrics::Metrics;
use crate::models::Settings;
use crate::state::StateManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct KeeperContext {
    pub settings: Arc<Settings>,
    pub resources: Arc<ResourceRegistry>,
    pub state: StateManager,
    pub metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl KeeperContext {
    pub fn init(settings: Settings) -> Arc<Self> {
        tracing::debug!(
            "Context initialized: quiet period {:?}, acquire timeout {:?}, {} tool version(s)",
            settings.dispatch.quiet_period(),
            settings.resources.acquire_timeout(),
            settings.tool_versions.len()
        );
        Arc::new(Self {
            settings: Arc::new(settings),
            resources: Arc::new(ResourceRegistry::new()),
            state: StateManager::new(),
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Child token cancelled when the context shuts down. Dispatch loops and
    /// event consumers select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every loop started from this context and log the metrics summary.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down");
        self.shutdown.cancel();
        self.metrics.log_summary();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for KeeperContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeeperContext")
            .field("settings", &self.settings)
            .field("resources", &self.resources.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
