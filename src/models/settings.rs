use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application settings from `projkeeper.yaml`.
///
/// Every section has defaults, so an empty or missing file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub dispatch: DispatchSettings,
    pub resources: ResourceSettings,
    pub conversion: ConversionSettings,

    /// Generated-files directory overrides (`MocDir`, `UicDir`, `RccDir`).
    pub tool_dirs: IndexMap<String, String>,

    /// Known tool installations: version name to install directory.
    pub tool_versions: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: String,
    pub prefix: String,
    pub debug: bool,
    pub console: bool,
    /// Write file logs as JSON lines instead of plain text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            prefix: "projkeeper".to_string(),
            debug: false,
            console: false,
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// A queued build waits until no new request arrived for this long.
    pub quiet_period_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            quiet_period_ms: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl DispatchSettings {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub acquire_timeout_ms: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

impl ResourceSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    /// Ask before converting projects that cannot be converted silently.
    pub notify: bool,
    /// Tool version used when a legacy project names none for a platform.
    pub default_tool_version: Option<String>,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            notify: true,
            default_tool_version: None,
        }
    }
}

/// Read-only key/value lookups for tool settings.
pub trait SettingsStore: Send + Sync {
    fn lookup(&self, key: &str) -> Option<String>;
}

impl SettingsStore for Settings {
    fn lookup(&self, key: &str) -> Option<String> {
        self.tool_dirs.get(key).cloned()
    }
}

/// Generated-files directory for a tool, honoring overrides.
pub fn generated_dir(store: &dyn SettingsStore, key: &str) -> String {
    match store.lookup(key) {
        Some(dir) if !dir.trim().is_empty() => dir.trim().trim_end_matches(['\\', '/']).to_string(),
        _ if key == "MocDir" => "GeneratedFiles\\$(ConfigurationName)".to_string(),
        _ => "GeneratedFiles".to_string(),
    }
}
