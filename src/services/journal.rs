use crate::models::document::write_atomic;
use crate::models::{
    ConversionReport, DocumentError, FileChange, MigrationCommit, StructuredDocument, TreeNode,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Failed to write {path} after writing {} other file(s): {source}", written.len())]
    Persist {
        path: Utf8PathBuf,
        /// Files already written before the failure; they stay on disk.
        written: Vec<Utf8PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write conversion report {path}: {source}")]
    Report {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize conversion report: {0}")]
    ReportFormat(#[from] serde_json::Error),
}

/// Handle to a document tracked by a [`TransactionJournal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(usize);

/// State captured by [`TransactionJournal::savepoint`].
#[derive(Debug, Clone)]
pub struct Savepoint {
    trees: Vec<TreeNode>,
    commits: usize,
}

/// What [`TransactionJournal::save`] did.
#[derive(Debug, Clone, Default)]
pub struct SaveOutcome {
    pub written: Vec<Utf8PathBuf>,
    pub files_changed: Vec<FileChange>,
    pub report_path: Option<Utf8PathBuf>,
}

/// Edit journal over a set of documents.
///
/// Edits are made on each document's working tree and recorded as named commits;
/// `rollback` discards whatever has not been committed yet.
#[derive(Debug, Default)]
pub struct TransactionJournal {
    documents: Vec<StructuredDocument>,
    commits: Vec<MigrationCommit>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, document: StructuredDocument) -> DocumentId {
        self.documents.push(document);
        DocumentId(self.documents.len() - 1)
    }

    pub fn document(&self, id: DocumentId) -> Option<&StructuredDocument> {
        self.documents.get(id.0)
    }

    pub fn document_mut(&mut self, id: DocumentId) -> Option<&mut StructuredDocument> {
        self.documents.get_mut(id.0)
    }

    /// Mutable access to two distinct documents at once.
    pub fn pair_mut(
        &mut self,
        first: DocumentId,
        second: Option<DocumentId>,
    ) -> (Option<&mut StructuredDocument>, Option<&mut StructuredDocument>) {
        let mut pair = (None, None);
        for (index, doc) in self.documents.iter_mut().enumerate() {
            if index == first.0 {
                pair.0 = Some(doc);
            } else if second.is_some_and(|id| id.0 == index) {
                pair.1 = Some(doc);
            }
        }
        pair
    }

    pub fn documents(&self) -> impl Iterator<Item = &StructuredDocument> {
        self.documents.iter()
    }

    pub fn commits(&self) -> &[MigrationCommit] {
        &self.commits
    }

    pub fn is_dirty(&self) -> bool {
        self.documents.iter().any(StructuredDocument::is_dirty)
    }

    /// Record every uncommitted edit under `message`.
    ///
    /// # Returns
    /// The new commit, or None if no document had uncommitted edits
    pub fn commit(&mut self, message: &str) -> Option<&MigrationCommit> {
        let mut changes = Vec::new();
        for doc in &mut self.documents {
            if !doc.is_dirty() {
                continue;
            }
            match (doc.committed_text(), doc.text()) {
                (Ok(before), Ok(after)) => {
                    if before != after {
                        changes.push(FileChange {
                            path: doc.path().to_owned(),
                            before,
                            after,
                        });
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Commit '{}': cannot snapshot {}: {}", message, doc.path(), e);
                }
            }
            doc.mark_committed();
        }
        if changes.is_empty() {
            return None;
        }
        tracing::debug!("Commit '{}' ({} file(s))", message, changes.len());
        self.commits.push(MigrationCommit {
            message: message.to_string(),
            changes,
        });
        self.commits.last()
    }

    /// Discard uncommitted edits in every document.
    pub fn rollback(&mut self) {
        for doc in &mut self.documents {
            doc.revert();
        }
    }

    /// Capture the committed state of every document and the commit count.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            trees: self
                .documents
                .iter()
                .map(|d| d.committed_root().clone())
                .collect(),
            commits: self.commits.len(),
        }
    }

    /// Restore documents to a savepoint and forget commits made since.
    ///
    /// Documents tracked after the savepoint was taken are left alone.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) {
        for (doc, tree) in self.documents.iter_mut().zip(&savepoint.trees) {
            doc.restore(tree.clone());
        }
        self.commits.truncate(savepoint.commits);
    }

    /// Write every document that differs from disk, then persist a conversion report
    /// if any file actually changed.
    ///
    /// Each file is written atomically. A failure stops the run; files written before
    /// it stay on disk and are listed in the error.
    pub fn save(&mut self, report_path: Option<&Utf8Path>) -> Result<SaveOutcome, JournalError> {
        let mut outcome = SaveOutcome::default();
        for doc in &mut self.documents {
            if !doc.needs_save() {
                continue;
            }
            let path = doc.path().to_owned();
            let before = fs::read_to_string(&path).unwrap_or_default();
            let written = doc.save().and_then(|()| fs::read_to_string(&path));
            let after = match written {
                Ok(after) => after,
                Err(source) => {
                    tracing::error!("Failed to save {}: {}", path, source);
                    return Err(JournalError::Persist {
                        path,
                        written: outcome.written,
                        source,
                    });
                }
            };
            outcome.written.push(path.clone());
            if before != after {
                outcome.files_changed.push(FileChange {
                    path,
                    before,
                    after,
                });
            }
        }

        if outcome.files_changed.is_empty() {
            return Ok(outcome);
        }
        if let Some(report_path) = report_path {
            let report = ConversionReport::new(&outcome.files_changed, &self.commits);
            let text = serde_json::to_string_pretty(&report)?;
            write_atomic(report_path, &text).map_err(|source| JournalError::Report {
                path: report_path.to_owned(),
                source,
            })?;
            tracing::info!("Conversion report written to {}", report_path);
            outcome.report_path = Some(report_path.to_owned());
        }
        Ok(outcome)
    }
}
