//! Text codecs between descriptor files and [`TreeNode`] trees.
//!
//! Both codecs are lossless for everything the rest of the crate looks at: element
//! and member order, attribute order, comments in XML, and the number/bool/null
//! distinction in JSON. Whitespace between XML elements is not preserved; output is
//! always re-indented the way the IDE writes these files.

pub mod json;
pub mod xml;

use crate::models::{NodeKind, TreeNode};
use thiserror::Error;

/// On-disk format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Xml,
    Json,
}

impl DocumentFormat {
    /// Guess the format from a file name. Preset files are JSON, everything else
    /// (`.vcxproj`, `.filters`, `.user`, ...) is XML.
    pub fn from_path(path: &str) -> Self {
        if path.to_ascii_lowercase().ends_with(".json") {
            DocumentFormat::Json
        } else {
            DocumentFormat::Xml
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn detect(text: &str) -> Self {
        if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Everything about a file's text that lives outside its tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextLayout {
    /// Raw XML declaration (`<?xml ...?>`), re-emitted verbatim.
    pub declaration: Option<String>,
    /// Comments preceding the XML root element.
    pub prolog_comments: Vec<String>,
    pub line_ending: LineEnding,
    pub trailing_newline: bool,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("XML syntax error at line {line}: {message}")]
    Xml { line: usize, message: String },

    #[error("Unexpected closing tag </{name}> at line {line}")]
    Unbalanced { name: String, line: usize },

    #[error("Document has no root element")]
    MissingRoot,

    #[error("JSON syntax error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Node of kind {kind:?} cannot be written as {format:?}")]
    WrongKind {
        kind: NodeKind,
        format: DocumentFormat,
    },
}

/// Parse text in the given format.
pub fn parse(format: DocumentFormat, text: &str) -> Result<(TreeNode, TextLayout), CodecError> {
    match format {
        DocumentFormat::Xml => xml::parse(text),
        DocumentFormat::Json => json::parse(text),
    }
}

/// Serialize a tree back to file text.
pub fn serialize(
    format: DocumentFormat,
    root: &TreeNode,
    layout: &TextLayout,
) -> Result<String, CodecError> {
    match format {
        DocumentFormat::Xml => xml::write(root, layout),
        DocumentFormat::Json => json::write(root, layout),
    }
}

/// Layout-independent text of a subtree, used for hashing.
///
/// JSON kinds are written as indented JSON, elements as indented XML without a
/// declaration; line endings are always `\n`.
pub fn canonical(node: &TreeNode) -> Result<String, CodecError> {
    match node.kind {
        NodeKind::Object | NodeKind::Array | NodeKind::Scalar(_) => json::to_pretty(node),
        NodeKind::Element | NodeKind::Comment => Ok(xml::write_fragment(node, LineEnding::Lf)),
    }
}
