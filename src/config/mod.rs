use crate::models::Settings;
use ::config::{Config, Environment};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Settings file name inside the configuration directory.
pub const SETTINGS_FILE: &str = "projkeeper.yaml";

/// Prefix of environment overrides, e.g. `PROJKEEPER__DISPATCH__QUIET_PERIOD_MS=250`.
pub const ENV_PREFIX: &str = "PROJKEEPER";

/// Configuration manager for loading and saving the YAML settings file.
///
/// The file holds every [`Settings`] section; sections or fields it leaves out
/// take their defaults. Scalar settings can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing `projkeeper.yaml`; created if missing
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE),
            config_dir,
        })
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Load the settings file, then apply environment overrides.
    ///
    /// # Returns
    /// The loaded Settings, or defaults (plus overrides) if the file doesn't exist
    pub fn load_settings(&self) -> Result<Settings> {
        self.load_settings_with(Self::environment())
    }

    fn load_settings_with(&self, environment: Environment) -> Result<Settings> {
        let mut settings = if self.settings_path.exists() {
            let file_contents = fs::read_to_string(&self.settings_path)
                .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;
            let settings: Settings = serde_yaml_ng::from_str(&file_contents)
                .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;
            tracing::info!("Loaded settings from {}", self.settings_path);
            settings
        } else {
            tracing::warn!(
                "Settings file not found at {}, using defaults",
                self.settings_path
            );
            Settings::default()
        };

        let overrides = Config::builder()
            .add_source(environment)
            .build()
            .context("Failed to read environment overrides")?;
        apply_overrides(&mut settings, &overrides)?;

        Ok(settings)
    }

    /// Save the settings file.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

/// Overlay scalar settings present in `overrides`.
///
/// Map sections (`tool_dirs`, `tool_versions`) are file-only: their keys contain
/// dots and mixed case, which environment keys cannot express.
fn apply_overrides(settings: &mut Settings, overrides: &Config) -> Result<()> {
    fn millis(overrides: &Config, key: &str, target: &mut u64) -> Result<()> {
        if let Ok(value) = overrides.get_int(key) {
            *target = u64::try_from(value)
                .with_context(|| format!("{} must not be negative, got {}", key, value))?;
            tracing::debug!("Override {} = {}", key, value);
        }
        Ok(())
    }
    fn flag(overrides: &Config, key: &str, target: &mut bool) {
        if let Ok(value) = overrides.get_bool(key) {
            *target = value;
            tracing::debug!("Override {} = {}", key, value);
        }
    }
    fn text(overrides: &Config, key: &str, target: &mut String) {
        if let Ok(value) = overrides.get_string(key) {
            tracing::debug!("Override {} = {}", key, value);
            *target = value;
        }
    }

    text(overrides, "logging.dir", &mut settings.logging.dir);
    text(overrides, "logging.prefix", &mut settings.logging.prefix);
    flag(overrides, "logging.debug", &mut settings.logging.debug);
    flag(overrides, "logging.console", &mut settings.logging.console);
    flag(overrides, "logging.json", &mut settings.logging.json);
    millis(overrides, "dispatch.quiet_period_ms", &mut settings.dispatch.quiet_period_ms)?;
    millis(overrides, "dispatch.poll_interval_ms", &mut settings.dispatch.poll_interval_ms)?;
    millis(overrides, "resources.acquire_timeout_ms", &mut settings.resources.acquire_timeout_ms)?;
    flag(overrides, "conversion.notify", &mut settings.conversion.notify);
    if let Ok(version) = overrides.get_string("conversion.default_tool_version") {
        settings.conversion.default_tool_version = Some(version);
    }
    Ok(())
}
