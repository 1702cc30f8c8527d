//! Integration tests for the preset lifecycle
//!
//! These tests verify:
//! - Conversion of a referencing folder, confirmed through the prompt
//! - A stale root checksum is rewritten exactly once
//! - Tampered managed records are healed and recreated
//! - Placeholder files are removed when nothing references the tool
//! - Events drive checks until cancelled

use camino::Utf8PathBuf;
use projkeeper::services::presets::{NULL_PRESETS_TEXT, PRESETS_FILE, USER_PRESETS_FILE};
use projkeeper::services::{
    ChecksumLedger, FixedPrompt, PresetProject, ProjectEvent, PromptResponse,
};
use projkeeper::{KeeperContext, PresetStatus, Settings, StructuredDocument};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use tokio::sync::mpsc;

const LISTS: &str = "cmake_minimum_required(VERSION 3.16)\nproject(app)\nfind_package(Qt6 REQUIRED COMPONENTS Core)\n";

fn folder() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn context() -> Arc<KeeperContext> {
    let mut settings = Settings::default();
    settings
        .tool_versions
        .insert("6.7.2".to_string(), "C:\\Qt\\6.7.2\\msvc2019_64".to_string());
    KeeperContext::init(settings)
}

fn generation(context: &KeeperContext) -> u64 {
    context
        .state
        .snapshot()
        .project("app")
        .map(|p| p.cache_generation)
        .unwrap_or_default()
}

/// A folder whose presets were converted with the user's confirmation.
async fn converted() -> (TempDir, Utf8PathBuf, Arc<KeeperContext>, PresetProject) {
    let (dir, root) = folder();
    fs::write(root.join("CMakeLists.txt"), LISTS).unwrap();

    let context = context();
    let project = PresetProject::new(
        "app",
        &root,
        Arc::clone(&context),
        Arc::new(FixedPrompt(PromptResponse::Confirmed)),
    );
    context.state.set_active_project(Some("app"));
    project.check_status().await;
    assert_eq!(project.status(), PresetStatus::Valid);
    (dir, root, context, project)
}

#[tokio::test]
async fn test_conversion_writes_sealed_presets() {
    let (_dir, root, context, _project) = converted().await;

    let ledger = ChecksumLedger::default();
    for file in [PRESETS_FILE, USER_PRESETS_FILE] {
        let doc = StructuredDocument::load(root.join(file)).unwrap();
        assert!(ledger.verify(&doc).all_valid, "{} does not verify", file);
    }
    assert_eq!(generation(&context), 1);
}

#[tokio::test]
async fn test_stale_root_checksum_written_once() {
    let (_dir, root, context, project) = converted().await;

    // The user adds a preset of their own, which invalidates the root digest only
    let path = root.join(PRESETS_FILE);
    let mut value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    value["configurePresets"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({ "name": "ninja", "generator": "Ninja", "inherits": "Qt" }));
    fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

    let ledger = ChecksumLedger::default();
    let stale = ledger.verify(&StructuredDocument::load(&path).unwrap());
    assert_eq!(stale.invalid.len(), 1);
    assert!(stale.invalid[0].owner.is_root());

    project.check_status().await;
    assert_eq!(generation(&context), 2);
    let resealed = fs::read_to_string(&path).unwrap();
    assert!(ledger.verify(&StructuredDocument::load(&path).unwrap()).all_valid);
    assert!(resealed.contains("\"ninja\""));

    // Nothing left to do: no write, no cache invalidation
    project.check_status().await;
    assert_eq!(generation(&context), 2);
    assert_eq!(fs::read_to_string(&path).unwrap(), resealed);
}

#[tokio::test]
async fn test_tampered_record_is_recreated() {
    let (_dir, root, context, project) = converted().await;

    let path = root.join(PRESETS_FILE);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("$env{QTDIR}"));
    fs::write(&path, text.replace("$env{QTDIR}", "C:/elsewhere")).unwrap();

    project.check_status().await;
    assert_eq!(project.status(), PresetStatus::Valid);
    assert_eq!(context.metrics.checksum_heals.load(Ordering::Relaxed), 1);

    let healed = fs::read_to_string(&path).unwrap();
    assert!(healed.contains("$env{QTDIR}"));
    assert!(!healed.contains("C:/elsewhere"));
    let doc = StructuredDocument::load(&path).unwrap();
    assert!(ChecksumLedger::default().verify(&doc).all_valid);
}

#[tokio::test]
async fn test_dismissed_prompt_leaves_folder_alone() {
    let (_dir, root) = folder();
    fs::write(root.join("CMakeLists.txt"), LISTS).unwrap();

    let context = context();
    let project = PresetProject::new(
        "app",
        &root,
        Arc::clone(&context),
        Arc::new(FixedPrompt(PromptResponse::Dismissed)),
    );
    context.state.set_active_project(Some("app"));
    project.check_status().await;

    assert_eq!(project.status(), PresetStatus::PendingConversion);
    assert!(!root.join(PRESETS_FILE).exists());
    assert!(!root.join(USER_PRESETS_FILE).exists());
    assert_eq!(generation(&context), 0);
}

#[tokio::test]
async fn test_placeholder_removed_on_scan() {
    let (_dir, root) = folder();
    fs::write(root.join("CMakeLists.txt"), "project(plain C)\n").unwrap();
    fs::write(root.join(USER_PRESETS_FILE), NULL_PRESETS_TEXT).unwrap();

    let context = context();
    let project = PresetProject::new(
        "app",
        &root,
        Arc::clone(&context),
        Arc::new(FixedPrompt(PromptResponse::Dismissed)),
    );
    assert_eq!(project.status(), PresetStatus::NullPlaceholder);
    context.state.set_active_project(Some("app"));

    project.handle_event(ProjectEvent::ScanCompleted).await;
    assert_eq!(project.status(), PresetStatus::Absent);
    assert!(!root.join(USER_PRESETS_FILE).exists());
}

#[tokio::test]
async fn test_event_loop_checks_on_list_change() {
    let (_dir, root) = folder();
    let context = context();
    let project = Arc::new(PresetProject::new(
        "app",
        &root,
        Arc::clone(&context),
        Arc::new(FixedPrompt(PromptResponse::Confirmed)),
    ));
    context.state.set_active_project(Some("app"));

    let (tx, rx) = mpsc::channel(8);
    let cancel = context.shutdown_token();
    let worker = tokio::spawn(Arc::clone(&project).run_events(rx, cancel));

    // A source file change is ignored; a list change triggers the check
    fs::write(root.join("CMakeLists.txt"), LISTS).unwrap();
    tx.send(ProjectEvent::FileChanged {
        path: root.join("main.cpp"),
    })
    .await
    .unwrap();
    tx.send(ProjectEvent::FileChanged {
        path: root.join("CMakeLists.txt"),
    })
    .await
    .unwrap();
    drop(tx);
    worker.await.unwrap();

    assert_eq!(project.status(), PresetStatus::Valid);
    assert!(root.join(PRESETS_FILE).exists());
    context.shutdown();
}
