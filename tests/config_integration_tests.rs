//! Integration tests for ConfigManager and settings file handling
//!
//! These tests verify:
//! - Default settings when no file exists
//! - Partial files falling back to defaults per field
//! - Tool maps with dotted keys surviving a round trip
//! - Settings flowing into the services that read them
//! - Invalid YAML handling

use camino::Utf8PathBuf;
use projkeeper::config::SETTINGS_FILE;
use projkeeper::services::SchemaMigrator;
use projkeeper::{ConfigManager, KeeperContext, Settings};
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), &config_path);
    assert_eq!(manager.settings_path(), config_path.join(SETTINGS_FILE));
}

#[test]
fn test_config_directory_creation() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let nested = config_path.join("nested").join("config");
    assert!(!nested.exists());

    ConfigManager::new(&nested).unwrap();
    assert!(nested.is_dir());
}

#[test]
fn test_load_default_settings() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    // No file yet, should return defaults
    let settings = manager.load_settings().unwrap();
    assert_eq!(settings.dispatch.quiet_period_ms, 1000);
    assert_eq!(settings.resources.acquire_timeout_ms, 30_000);
    assert!(settings.conversion.notify);
    assert!(settings.tool_versions.is_empty());
}

#[test]
fn test_partial_settings_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(
        manager.settings_path(),
        r#"
dispatch:
  quiet_period_ms: 250
conversion:
  default_tool_version: "6.7.2"
tool_versions:
  "6.7.2": 'C:\Qt\6.7.2\msvc2019_64'
  "5.15.2": 'C:\Qt\5.15.2\msvc2019_64'
tool_dirs:
  MocDir: 'gen\moc\'
"#,
    )
    .unwrap();

    let settings = manager.load_settings().unwrap();
    assert_eq!(settings.dispatch.quiet_period_ms, 250);
    assert_eq!(settings.dispatch.poll_interval_ms, 100);
    assert_eq!(
        settings.conversion.default_tool_version.as_deref(),
        Some("6.7.2")
    );
    let versions: Vec<_> = settings.tool_versions.keys().map(String::as_str).collect();
    assert_eq!(versions, vec!["6.7.2", "5.15.2"]);

    // Settings reach the services that read them
    let migrator = SchemaMigrator::from_settings(&settings);
    assert_eq!(migrator.default_tool_version(), Some("6.7.2"));
    assert_eq!(
        projkeeper::models::settings::generated_dir(migrator.settings(), "MocDir"),
        r"gen\moc"
    );
}

#[test]
fn test_save_and_load_settings() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let mut settings = Settings::default();
    settings.logging.json = true;
    settings.conversion.notify = false;
    settings
        .tool_versions
        .insert("6.8.0".to_string(), "/opt/Qt/6.8.0/gcc_64".to_string());
    manager.save_settings(&settings).unwrap();

    let loaded = manager.load_settings().unwrap();
    assert!(loaded.logging.json);
    assert!(!loaded.conversion.notify);
    assert_eq!(loaded.tool_versions["6.8.0"], "/opt/Qt/6.8.0/gcc_64");
}

#[test]
fn test_invalid_yaml_handling() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    fs::write(manager.settings_path(), "tool_versions: [not, a, map").unwrap();

    let result = manager.load_settings();
    assert!(result.is_err());
    assert!(format!("{:#}", result.unwrap_err()).contains(SETTINGS_FILE));
}

#[test]
fn test_context_shares_loaded_settings() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();
    let mut settings = Settings::default();
    settings.resources.acquire_timeout_ms = 1234;
    manager.save_settings(&settings).unwrap();

    let context = KeeperContext::init(manager.load_settings().unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let context = Arc::clone(&context);
            thread::spawn(move || context.settings.resources.acquire_timeout_ms)
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1234);
    }
}
