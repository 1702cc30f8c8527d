use crate::codec::{self, CodecError};
use crate::models::{NodeKind, NodePath, StructuredDocument, TreeNode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

/// Vendor key prefix marking tool-managed records.
pub const VENDOR_PREFIX: &str = "qt-project.org";

/// One managed record found during verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    /// Location of the record in the tree it was verified against.
    pub owner: NodePath,
    /// Vendor key, e.g. `qt-project.org/Presets`.
    pub record_type: String,
    pub stored: Option<String>,
    pub recomputed: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub all_valid: bool,
    pub invalid: Vec<ChecksumRecord>,
}

/// Computes and checks digests of tool-managed subtrees.
///
/// A subtree is managed when it carries vendor metadata under a key starting with the
/// vendor prefix:
/// - JSON: `{"vendor": {"qt-project.org/...": {"checksum": "..."}}}`
/// - XML: `<Vendor Name="qt-project.org/..." Checksum="..." />` as a direct child
///
/// The digest covers the whole subtree with its own checksum field removed.
#[derive(Debug, Clone)]
pub struct ChecksumLedger {
    vendor_prefix: String,
}

impl Default for ChecksumLedger {
    fn default() -> Self {
        Self::new(VENDOR_PREFIX)
    }
}

impl ChecksumLedger {
    pub fn new(vendor_prefix: impl Into<String>) -> Self {
        Self {
            vendor_prefix: vendor_prefix.into(),
        }
    }

    pub fn vendor_prefix(&self) -> &str {
        &self.vendor_prefix
    }

    fn info_index(&self, node: &TreeNode) -> Option<(usize, Option<usize>)> {
        match node.kind {
            NodeKind::Object => {
                let vendor = node.position(|c| c.name == "vendor" && c.kind == NodeKind::Object)?;
                let info = node.children[vendor].position(|c| {
                    c.kind == NodeKind::Object && c.name.starts_with(&self.vendor_prefix)
                })?;
                Some((vendor, Some(info)))
            }
            NodeKind::Element => {
                let vendor = node.position(|c| {
                    c.kind == NodeKind::Element
                        && c.name == "Vendor"
                        && c.attr("Name").is_some_and(|n| n.starts_with(&self.vendor_prefix))
                })?;
                Some((vendor, None))
            }
            NodeKind::Array | NodeKind::Scalar(_) | NodeKind::Comment => None,
        }
    }

    /// Vendor metadata node of a managed record.
    fn info<'a>(&self, node: &'a TreeNode) -> Option<&'a TreeNode> {
        let (vendor, info) = self.info_index(node)?;
        let vendor = &node.children[vendor];
        match info {
            Some(info) => vendor.children.get(info),
            None => Some(vendor),
        }
    }

    fn info_mut<'a>(&self, node: &'a mut TreeNode) -> Option<&'a mut TreeNode> {
        let (vendor, info) = self.info_index(node)?;
        let vendor = &mut node.children[vendor];
        match info {
            Some(info) => vendor.children.get_mut(info),
            None => Some(vendor),
        }
    }

    pub fn is_managed(&self, node: &TreeNode) -> bool {
        self.info_index(node).is_some()
    }

    /// Vendor key of a managed record.
    pub fn record_type<'a>(&self, node: &'a TreeNode) -> Option<&'a str> {
        let info = self.info(node)?;
        match info.kind {
            NodeKind::Element => info.attr("Name"),
            _ => Some(info.name.as_str()),
        }
    }

    pub fn stored_checksum<'a>(&self, node: &'a TreeNode) -> Option<&'a str> {
        let info = self.info(node)?;
        match info.kind {
            NodeKind::Element => info.attr("Checksum"),
            _ => info
                .child("checksum")
                .filter(|c| c.kind != NodeKind::Scalar(crate::models::ScalarType::Null))
                .map(|c| c.value()),
        }
    }

    fn set_checksum(&self, node: &mut TreeNode, checksum: &str) -> bool {
        let Some(info) = self.info_mut(node) else {
            return false;
        };
        match info.kind {
            NodeKind::Element => info.set_attr("Checksum", checksum),
            _ => info.set_member(TreeNode::string("checksum", checksum)),
        }
        true
    }

    fn strip_checksum(&self, node: &mut TreeNode) {
        if let Some(info) = self.info_mut(node) {
            match info.kind {
                NodeKind::Element => {
                    info.remove_attr("Checksum");
                }
                _ => {
                    info.remove_children(|c| c.name == "checksum");
                }
            }
        }
    }

    /// Base64 SHA-256 of the subtree's canonical text, without its own checksum.
    pub fn digest(&self, node: &TreeNode) -> Result<String, CodecError> {
        let mut copy = node.clone();
        self.strip_checksum(&mut copy);
        let text = codec::canonical(&copy)?;
        let hash = Sha256::digest(text.as_bytes());
        Ok(STANDARD.encode(hash))
    }

    /// Paths of every managed record in a tree, root included, in pre-order.
    pub fn managed_paths(&self, root: &TreeNode) -> Vec<NodePath> {
        root.walk()
            .into_iter()
            .filter(|(_, node)| self.is_managed(node))
            .map(|(path, _)| path)
            .collect()
    }

    /// Compare stored and recomputed digests of every managed record.
    pub fn verify(&self, doc: &StructuredDocument) -> VerifyResult {
        self.verify_tree(doc.root())
    }

    pub fn verify_tree(&self, root: &TreeNode) -> VerifyResult {
        let mut invalid = Vec::new();
        for path in self.managed_paths(root) {
            let Some(node) = root.get(&path) else {
                continue;
            };
            let stored = self.stored_checksum(node).map(str::to_string);
            let recomputed = self.digest(node).unwrap_or_default();
            if recomputed.is_empty() || stored.as_deref() != Some(recomputed.as_str()) {
                invalid.push(ChecksumRecord {
                    owner: path,
                    record_type: self.record_type(node).unwrap_or_default().to_string(),
                    stored,
                    recomputed,
                });
            }
        }
        VerifyResult {
            all_valid: invalid.is_empty(),
            invalid,
        }
    }

    /// Delete every invalid record except the document root.
    ///
    /// # Returns
    /// Number of subtrees deleted
    pub fn heal(&self, doc: &mut StructuredDocument, result: &VerifyResult) -> usize {
        self.heal_tree(doc.root_mut(), result)
    }

    pub fn heal_tree(&self, root: &mut TreeNode, result: &VerifyResult) -> usize {
        let mut paths: Vec<&NodePath> = result
            .invalid
            .iter()
            .map(|r| &r.owner)
            .filter(|p| !p.is_root())
            .collect();
        // Later siblings and descendants first, so earlier paths stay valid.
        paths.sort();
        paths.dedup();
        let mut removed = 0;
        for path in paths.into_iter().rev() {
            if root.remove_at(path).is_some() {
                tracing::warn!("Removed managed record at {} (checksum mismatch)", path);
                removed += 1;
            }
        }
        removed
    }

    /// Rewrite every stale stored digest.
    ///
    /// Nested records are resealed before the records containing them, so the outer
    /// digests cover the updated inner ones.
    ///
    /// # Returns
    /// Number of digests rewritten
    pub fn reseal(&self, doc: &mut StructuredDocument) -> usize {
        self.reseal_tree(doc.root_mut())
    }

    pub fn reseal_tree(&self, root: &mut TreeNode) -> usize {
        let mut rewritten = 0;
        for path in self.managed_paths(root).into_iter().rev() {
            let Some(node) = root.get_mut(&path) else {
                continue;
            };
            let Ok(digest) = self.digest(node) else {
                continue;
            };
            if self.stored_checksum(node) != Some(digest.as_str()) && self.set_checksum(node, &digest) {
                rewritten += 1;
            }
        }
        rewritten
    }

    /// Verify and heal a set of documents together.
    ///
    /// # Returns
    /// true if every record was valid
    pub fn verify_and_heal(&self, docs: &mut [&mut StructuredDocument]) -> bool {
        let mut all_valid = true;
        for doc in docs.iter_mut() {
            let result = self.verify(doc);
            if !result.all_valid {
                all_valid = false;
                let removed = self.heal(doc, &result);
                tracing::info!(
                    "{}: {} invalid managed record(s), {} removed",
                    doc.path(),
                    result.invalid.len(),
                    removed
                );
            }
        }
        all_valid
    }

    /// Attach vendor metadata of type `record_type` to a JSON object and seal it.
    pub fn stamp(&self, node: &mut TreeNode, record_type: &str) {
        if !self.is_managed(node) {
            let info = TreeNode::object(record_type);
            match node.child_mut("vendor") {
                Some(vendor) if vendor.kind == NodeKind::Object => vendor.set_member(info),
                _ => node.set_member(TreeNode::object("vendor").with_child(info)),
            }
        }
        if let Ok(digest) = self.digest(node) {
            self.set_checksum(node, &digest);
        }
    }
}
