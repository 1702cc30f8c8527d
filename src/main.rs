//! projkeeper - command-line entry point.
//!
//! # Overview
//!
//! Initializes:
//! - Settings ([`ConfigManager`]: `projkeeper.yaml` plus `PROJKEEPER__` overrides)
//! - Logging infrastructure (file rotation + console output)
//! - Tokio runtime (migrations and preset checks take named resources asynchronously)
//! - The process-wide [`KeeperContext`]
//!
//! # Commands
//!
//! - `migrate <project> [--dry-run]`: upgrade a project descriptor to the current
//!   format and write it back together with a conversion report
//! - `check <folder> [--confirm]`: run one preset check for a CMake-style folder
//! - `verify <presets>...`: list managed records whose checksum does not match

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use projkeeper::services::{
    ChecksumLedger, FixedPrompt, PresetProject, PromptResponse, SchemaMigrator,
};
use projkeeper::{APP_NAME, ConfigManager, KeeperContext, StructuredDocument, VERSION};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "projkeeper", version, about)]
struct Cli {
    /// Directory holding projkeeper.yaml
    #[arg(long, global = true, default_value = ".projkeeper")]
    config: Utf8PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upgrade a project descriptor to the current format version
    Migrate {
        project: Utf8PathBuf,
        /// Show what would be committed without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one preset check for a CMake-style project folder
    Check {
        folder: Utf8PathBuf,
        /// Convert without asking if the presets need converting
        #[arg(long)]
        confirm: bool,
    },
    /// Report managed records with invalid checksums, without writing
    Verify {
        #[arg(required = true)]
        files: Vec<Utf8PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config)?;
    let mut settings = config_manager.load_settings()?;
    settings.logging.debug |= cli.debug;
    settings.logging.console = true;

    // Guard must outlive every log call
    let _guard = projkeeper::logging::setup_logging(&settings.logging)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("projkeeper-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let context = KeeperContext::init(settings);
    let result = match cli.command {
        Command::Migrate { project, dry_run } => {
            runtime.block_on(migrate(Arc::clone(&context), project, dry_run))
        }
        Command::Check { folder, confirm } => {
            runtime.block_on(check(Arc::clone(&context), folder, confirm))
        }
        Command::Verify { files } => verify(&files),
    };

    context.shutdown();
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    match result {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) => {
            tracing::error!("{:#}", e);
            Err(e)
        }
    }
}

/// # Returns
/// false if some custom build steps could not be converted
async fn migrate(context: Arc<KeeperContext>, path: Utf8PathBuf, dry_run: bool) -> Result<bool> {
    let migrator = SchemaMigrator::from_settings(&context.settings);
    let run = migrator
        .migrate_path(&context, &path, dry_run)
        .await
        .with_context(|| format!("Failed to migrate {}", path))?;

    let outcome = &run.outcome;
    for issue in &outcome.issues {
        eprintln!("{}", issue);
    }

    match &run.saved {
        None => {
            for message in &run.commit_messages {
                println!("{}", message);
            }
            println!(
                "{}: format {} -> {}, {} commit(s), nothing written",
                path, outcome.from, outcome.to, outcome.commits
            );
        }
        Some(saved) => {
            for file in &saved.written {
                println!("wrote {}", file);
            }
            if let Some(report) = &saved.report_path {
                println!("report {}", report);
            }
        }
    }
    Ok(outcome.is_success())
}

/// # Returns
/// false if the folder still waits for a conversion
async fn check(context: Arc<KeeperContext>, folder: Utf8PathBuf, confirm: bool) -> Result<bool> {
    if !folder.is_dir() {
        anyhow::bail!("{} is not a directory", folder);
    }
    let response = if confirm {
        PromptResponse::Confirmed
    } else {
        PromptResponse::Dismissed
    };
    let id = folder.to_string();
    let project = PresetProject::new(
        &id,
        folder,
        Arc::clone(&context),
        Arc::new(FixedPrompt(response)),
    );
    context.state.set_active_project(Some(&id));

    project.check_status().await;
    println!("{}: {}", project.folder(), project.status());
    Ok(project.status() != projkeeper::PresetStatus::PendingConversion)
}

/// # Returns
/// false if any file has an invalid managed record
fn verify(files: &[Utf8PathBuf]) -> Result<bool> {
    let ledger = ChecksumLedger::default();
    let mut all_valid = true;
    for path in files {
        let doc = StructuredDocument::load(path)
            .with_context(|| format!("Failed to load {}", path))?;
        let result = ledger.verify(&doc);
        if result.all_valid {
            println!("{}: ok", path);
            continue;
        }
        all_valid = false;
        for record in &result.invalid {
            println!(
                "{}: {} at {}: stored {}, expected {}",
                path,
                record.record_type,
                record.owner,
                record.stored.as_deref().unwrap_or("(none)"),
                record.recomputed
            );
        }
    }
    Ok(all_valid)
}
