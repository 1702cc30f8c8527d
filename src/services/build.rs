use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// A request to run targets of one project configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub project: Utf8PathBuf,
    /// `Configuration|Platform`, e.g. `Debug|x64`.
    pub config_id: String,
    pub properties: IndexMap<String, String>,
    pub targets: Vec<String>,
}

impl BuildRequest {
    pub fn new(project: impl Into<Utf8PathBuf>, config_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            config_id: config_id.into(),
            properties: IndexMap::new(),
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Queue key: requests for the same project collapse into one build.
    pub fn key(&self) -> String {
        self.project.as_str().to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One `file(line): error CODE: message` line of build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDiagnostic {
    pub file: String,
    pub line: Option<usize>,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub diagnostics: Vec<BuildDiagnostic>,
    pub duration: Duration,
}

impl BuildOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &BuildDiagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }
}

/// Errors that can occur while running the external build tool
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build tool not found: {0}")]
    ToolNotFound(Utf8PathBuf),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("Build cancelled")]
    Cancelled,
}

/// The external build tool, as seen by the dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run_targets(&self, request: &BuildRequest) -> Result<BuildOutcome, BuildError>;
}

/// Runs `msbuild`-compatible tools as subprocesses
///
/// Targets become `/t:`, the configuration and extra properties become `/p:`.
/// Diagnostics are parsed from standard output with `diagnostic_pattern`:
///
/// - Pattern: `file(line[,col]): error|warning CODE: message [project]`
/// - Example match: `main.cpp(12,5): error C2065: 'x': undeclared identifier [app.vcxproj]`
pub struct MsBuildRunner {
    program: Utf8PathBuf,
    timeout: Duration,
    diagnostic_pattern: Regex,
}

impl MsBuildRunner {
    pub fn new(program: impl Into<Utf8PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            diagnostic_pattern: Regex::new(
                r"^\s*(?P<file>[^()]+?)(?:\((?P<line>\d+)(?:,\d+)?\))?\s*:\s*(?P<severity>error|warning)\s+(?P<code>[A-Za-z]*\d+)\s*:\s*(?P<message>.*?)\s*(?:\[[^\]]*\])?\s*$",
            )
            .expect("Invalid diagnostic regex"),
        }
    }

    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// Command-line arguments for a request.
    pub fn arguments(&self, request: &BuildRequest) -> Vec<String> {
        let mut args = vec![
            request.project.to_string(),
            "/nologo".to_string(),
            "/v:minimal".to_string(),
        ];
        if !request.targets.is_empty() {
            args.push(format!("/t:{}", request.targets.join(";")));
        }
        let (configuration, platform) = request
            .config_id
            .split_once('|')
            .unwrap_or((request.config_id.as_str(), ""));
        if !configuration.is_empty() {
            args.push(format!("/p:Configuration={}", configuration));
        }
        if !platform.is_empty() {
            args.push(format!("/p:Platform={}", platform));
        }
        for (name, value) in &request.properties {
            args.push(format!("/p:{}={}", name, value));
        }
        args
    }

    /// Extract diagnostics from build output.
    pub fn parse_diagnostics(&self, output: &str) -> Vec<BuildDiagnostic> {
        output
            .lines()
            .filter_map(|line| self.diagnostic_pattern.captures(line))
            .map(|caps| BuildDiagnostic {
                file: caps["file"].trim().to_string(),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
                severity: if &caps["severity"] == "error" {
                    Severity::Error
                } else {
                    Severity::Warning
                },
                code: caps["code"].to_string(),
                message: caps["message"].to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl BuildRunner for MsBuildRunner {
    async fn run_targets(&self, request: &BuildRequest) -> Result<BuildOutcome, BuildError> {
        let args = self.arguments(request);
        tracing::info!("Executing: {} {}", self.program, args.join(" "));

        let start = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BuildError::ToolNotFound(self.program.clone()),
                _ => BuildError::Process(e),
            })?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::warn!("Build of {} timed out after {:?}", request.project, self.timeout);
                BuildError::Timeout(self.timeout)
            })??;

        let duration = start.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);
        let diagnostics = self.parse_diagnostics(&String::from_utf8_lossy(&output.stdout));
        for diagnostic in diagnostics.iter().filter(|d| d.severity == Severity::Error) {
            tracing::error!(
                "{}({}): {} {}",
                diagnostic.file,
                diagnostic.line.unwrap_or_default(),
                diagnostic.code,
                diagnostic.message
            );
        }

        tracing::info!(
            "Build of {} [{}] completed in {:.2}s with exit code {}",
            request.project,
            request.config_id,
            duration.as_secs_f32(),
            exit_code
        );

        Ok(BuildOutcome {
            success: output.status.success(),
            exit_code,
            diagnostics,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn runner() -> MsBuildRunner {
        MsBuildRunner::new("msbuild", Duration::from_secs(5))
    }

    #[test]
    fn test_arguments() {
        let request = BuildRequest::new("C:/src/app.vcxproj", "Debug|x64")
            .with_target("QtMoc")
            .with_target("QtUic")
            .with_property("SelectedFiles", "main.cpp");

        assert_eq!(
            runner().arguments(&request),
            vec![
                "C:/src/app.vcxproj",
                "/nologo",
                "/v:minimal",
                "/t:QtMoc;QtUic",
                "/p:Configuration=Debug",
                "/p:Platform=x64",
                "/p:SelectedFiles=main.cpp",
            ]
        );
    }

    #[test]
    fn test_arguments_without_platform() {
        let request = BuildRequest::new("app.vcxproj", "Release");
        let args = runner().arguments(&request);
        assert!(args.contains(&"/p:Configuration=Release".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("/p:Platform")));
        assert!(!args.iter().any(|a| a.starts_with("/t:")));
    }

    #[test]
    fn test_parse_diagnostics() {
        let output = "\
Build started.
  main.cpp
C:\\src\\main.cpp(12,5): error C2065: 'x': undeclared identifier [C:\\src\\app.vcxproj]
C:\\src\\widget.h(3): warning C4100: 'p': unreferenced parameter [C:\\src\\app.vcxproj]
LINK : error LNK1104: cannot open file 'Qt6Core.lib' [C:\\src\\app.vcxproj]
";
        let diagnostics = runner().parse_diagnostics(output);
        assert_eq!(diagnostics.len(), 3);

        assert_eq!(diagnostics[0].file, "C:\\src\\main.cpp");
        assert_eq!(diagnostics[0].line, Some(12));
        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[0].code, "C2065");
        assert_eq!(diagnostics[0].message, "'x': undeclared identifier");

        assert_eq!(diagnostics[1].severity, Severity::Warning);
        assert_eq!(diagnostics[2].file, "LINK");
        assert_eq!(diagnostics[2].line, None);
    }

    #[test]
    fn test_request_key_ignores_case() {
        let a = BuildRequest::new("C:/Src/App.vcxproj", "Debug|x64");
        let b = BuildRequest::new("c:/src/app.vcxproj", "Release|x64");
        assert_eq!(a.key(), b.key());
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let runner = MsBuildRunner::new("/nonexistent/msbuild", Duration::from_secs(1));
        let err = runner
            .run_targets(&BuildRequest::new("app.vcxproj", "Debug|x64"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status() {
        let request = BuildRequest::new("app.vcxproj", "Debug|x64");

        let outcome = MsBuildRunner::new("true", Duration::from_secs(5))
            .run_targets(&request)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);

        let outcome = MsBuildRunner::new("false", Duration::from_secs(5))
            .run_targets(&request)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.errors().count(), 0);
    }
}
