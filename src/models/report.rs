use crate::models::SchemaVersion;
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Before/after text of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: Utf8PathBuf,
    pub before: String,
    pub after: String,
}

impl FileChange {
    /// Unified diff of the change, with the file path in the headers.
    pub fn unified_diff(&self) -> String {
        let diff = TextDiff::from_lines(&self.before, &self.after);
        diff.unified_diff()
            .context_radius(3)
            .header(self.path.as_str(), self.path.as_str())
            .to_string()
    }
}

/// A named, atomic set of file changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCommit {
    pub message: String,
    pub changes: Vec<FileChange>,
}

/// Serialized form of a [`FileChange`] inside a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedChange {
    pub path: Utf8PathBuf,
    pub diff: String,
}

impl From<&FileChange> for ReportedChange {
    fn from(change: &FileChange) -> Self {
        Self {
            path: change.path.clone(),
            diff: change.unified_diff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedCommit {
    pub message: String,
    pub changes: Vec<ReportedChange>,
}

/// Audit record of a conversion, persisted next to the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionReport {
    pub timestamp: DateTime<Local>,
    pub files_changed: Vec<ReportedChange>,
    pub commits: Vec<ReportedCommit>,
}

impl ConversionReport {
    pub fn new(files_changed: &[FileChange], commits: &[MigrationCommit]) -> Self {
        Self {
            timestamp: Local::now(),
            files_changed: files_changed.iter().map(ReportedChange::from).collect(),
            commits: commits
                .iter()
                .map(|commit| ReportedCommit {
                    message: commit.message.clone(),
                    changes: commit.changes.iter().map(ReportedChange::from).collect(),
                })
                .collect(),
        }
    }

    pub fn commit_messages(&self) -> impl Iterator<Item = &str> {
        self.commits.iter().map(|c| c.message.as_str())
    }
}

/// A legacy build step that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionIssue {
    pub file: Utf8PathBuf,
    pub item: String,
    pub configuration: String,
    pub line: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for ConversionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}): error: converting \"{}\", configuration \"{}\": {}",
            self.file,
            self.line.unwrap_or(1),
            self.item,
            self.configuration,
            self.message
        )
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub commits: usize,
    pub issues: Vec<ConversionIssue>,
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_diff_has_headers() {
        let change = FileChange {
            path: "a.vcxproj".into(),
            before: "one\ntwo\n".into(),
            after: "one\nthree\n".into(),
        };
        let diff = change.unified_diff();
        assert!(diff.contains("--- a.vcxproj"));
        assert!(diff.contains("-two"));
        assert!(diff.contains("+three"));
    }

    #[test]
    fn test_report_serializes() {
        let change = FileChange {
            path: "a.vcxproj".into(),
            before: "x\n".into(),
            after: "y\n".into(),
        };
        let commit = MigrationCommit {
            message: "Setting project format version".into(),
            changes: vec![change.clone()],
        };
        let report = ConversionReport::new(&[change], &[commit]);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("Setting project format version"));
        assert_eq!(
            report.commit_messages().collect::<Vec<_>>(),
            vec!["Setting project format version"]
        );
    }

    #[test]
    fn test_issue_display() {
        let issue = ConversionIssue {
            file: "a.vcxproj".into(),
            item: "foo.h".into(),
            configuration: "Debug|x64".into(),
            line: Some(12),
            message: "failed to convert custom build command".into(),
        };
        assert_eq!(
            issue.to_string(),
            "a.vcxproj(12): error: converting \"foo.h\", configuration \"Debug|x64\": failed to convert custom build command"
        );
    }
}
