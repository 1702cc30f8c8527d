use crate::codec::{self, CodecError, DocumentFormat, TextLayout};
use crate::models::TreeNode;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: Utf8PathBuf,
        #[source]
        source: CodecError,
    },
}

/// A descriptor file held in memory as a tree.
///
/// Three copies of the tree are kept:
/// - `working`: where edits happen
/// - `committed`: the state as of the last journal commit
/// - `saved`: the state last read from or written to disk
///
/// Comparisons between them always go through the serializer, so two trees that
/// only differ in diagnostic line numbers compare equal.
#[derive(Debug, Clone)]
pub struct StructuredDocument {
    path: Utf8PathBuf,
    format: DocumentFormat,
    layout: TextLayout,
    working: TreeNode,
    committed: TreeNode,
    saved: TreeNode,
}

impl StructuredDocument {
    /// Parse a document from text, as if it had been read from `path`.
    pub fn parse(path: impl Into<Utf8PathBuf>, text: &str) -> Result<Self, DocumentError> {
        let path = path.into();
        let format = DocumentFormat::from_path(path.as_str());
        let (root, layout) = codec::parse(format, text).map_err(|source| DocumentError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            format,
            layout,
            committed: root.clone(),
            saved: root.clone(),
            working: root,
        })
    }

    /// Load a document from disk.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| DocumentError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Create a document that does not exist on disk yet.
    pub fn new(path: impl Into<Utf8PathBuf>, root: TreeNode, layout: TextLayout) -> Self {
        let path = path.into();
        let format = DocumentFormat::from_path(path.as_str());
        Self {
            path,
            format,
            layout,
            committed: root.clone(),
            saved: root.clone(),
            working: root,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    pub fn layout(&self) -> &TextLayout {
        &self.layout
    }

    /// Current working tree.
    pub fn root(&self) -> &TreeNode {
        &self.working
    }

    pub(crate) fn root_mut(&mut self) -> &mut TreeNode {
        &mut self.working
    }

    pub fn committed_root(&self) -> &TreeNode {
        &self.committed
    }

    fn render(&self, tree: &TreeNode) -> Result<String, DocumentError> {
        codec::serialize(self.format, tree, &self.layout).map_err(|source| {
            DocumentError::Serialize {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// Serialized working tree.
    pub fn text(&self) -> Result<String, DocumentError> {
        self.render(&self.working)
    }

    pub fn committed_text(&self) -> Result<String, DocumentError> {
        self.render(&self.committed)
    }

    /// Working tree differs from the last commit.
    pub fn is_dirty(&self) -> bool {
        match (self.text(), self.committed_text()) {
            (Ok(working), Ok(committed)) => working != committed,
            _ => true,
        }
    }

    /// Working tree differs from what is on disk.
    pub fn needs_save(&self) -> bool {
        match (self.text(), self.render(&self.saved)) {
            (Ok(working), Ok(saved)) => working != saved,
            _ => true,
        }
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = self.working.clone();
    }

    pub(crate) fn mark_saved(&mut self) {
        self.saved = self.working.clone();
    }

    /// Discard uncommitted edits.
    pub(crate) fn revert(&mut self) {
        self.working = self.committed.clone();
    }

    /// Replace both working and committed trees (used to restore a savepoint).
    pub(crate) fn restore(&mut self, tree: TreeNode) {
        self.committed = tree.clone();
        self.working = tree;
    }

    /// Write the working tree to its path and mark it saved.
    ///
    /// The file is written to a sibling temp file first and renamed into place, so a
    /// failed write never leaves a truncated file behind.
    pub fn save(&mut self) -> Result<(), std::io::Error> {
        let text = self
            .text()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        write_atomic(&self.path, &text)?;
        self.mark_saved();
        Ok(())
    }
}

/// Write `text` to `path` via a temp file in the same directory.
///
/// The temp file is synced to disk before it is renamed over `path`.
pub fn write_atomic(path: &Utf8Path, text: &str) -> std::io::Result<()> {
    let file_name = path.file_name().unwrap_or("document");
    let temp = path.with_file_name(format!(".{}.tmp", file_name));
    let result = write_synced(&temp, text).and_then(|()| fs::rename(&temp, path));
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn write_synced(path: &Utf8Path, text: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dirty_tracking() {
        let mut doc = StructuredDocument::parse("a.vcxproj", "<Project />").unwrap();
        assert!(!doc.is_dirty());

        doc.root_mut().children.push(TreeNode::element("ItemGroup"));
        assert!(doc.is_dirty());
        assert!(doc.needs_save());

        doc.mark_committed();
        assert!(!doc.is_dirty());
        assert!(doc.needs_save());

        doc.revert();
        assert_eq!(doc.root().children.len(), 1);
    }

    #[test]
    fn test_format_from_extension() {
        let doc = StructuredDocument::parse("CMakePresets.json", "{}").unwrap();
        assert_eq!(doc.format(), DocumentFormat::Json);
    }

    #[test]
    fn test_load_missing_file() {
        let err = StructuredDocument::load("/nonexistent/x.vcxproj").unwrap_err();
        assert!(matches!(err, DocumentError::Read { .. }));
    }

    #[test]
    fn test_save_writes_and_marks_saved() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("a.vcxproj")).unwrap();
        fs::write(&path, "<Project />").unwrap();

        let mut doc = StructuredDocument::load(&path).unwrap();
        doc.root_mut().set_attr("ToolsVersion", "17.0");
        doc.save().unwrap();

        assert!(!doc.needs_save());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "<Project ToolsVersion=\"17.0\" />"
        );
        let leftovers: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_write_atomic_replaces_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("CMakePresets.json")).unwrap();
        fs::write(&path, "{ \"version\": 2 }").unwrap();

        write_atomic(&path, "{ \"version\": 3 }\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ \"version\": 3 }\n");
        assert!(!temp.path().join(".CMakePresets.json.tmp").exists());
    }

    #[test]
    fn test_write_atomic_into_missing_dir_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("missing/a.vcxproj")).unwrap();
        assert!(write_atomic(&path, "<Project />").is_err());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
