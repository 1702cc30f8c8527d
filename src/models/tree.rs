use indexmap::IndexMap;
use std::fmt;

/// Scalar flavour of a JSON leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Number,
    Bool,
    Null,
}

/// Shape of a tree node.
///
/// XML descriptors only produce `Element` and `Comment` nodes; JSON presets only
/// produce `Object`, `Array` and `Scalar` nodes. Code that has to treat the two
/// families differently matches on this exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Comment,
    Object,
    Array,
    Scalar(ScalarType),
}

/// A node of a [`StructuredDocument`](crate::models::StructuredDocument).
///
/// - `name`: element name (XML) or member key (JSON object member; empty for array entries
///   and the document root)
/// - `attributes`: XML attributes, in source order (always empty for JSON nodes)
/// - `children`: child nodes, in source order
/// - `text`: element text (XML) or scalar value (JSON)
/// - `line`: 1-based source line of an XML element, for diagnostics only
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub name: String,
    pub kind: NodeKind,
    pub attributes: IndexMap<String, String>,
    pub children: Vec<TreeNode>,
    pub text: Option<String>,
    pub line: Option<usize>,
}

/// Child-index path from a document root to one of its nodes.
///
/// Paths are how the crate refers to nodes without holding borrows into the tree; they
/// are only meaningful for the tree they were computed from and go stale after any
/// structural edit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn parent(&self) -> Option<(NodePath, usize)> {
        let (last, rest) = self.0.split_last()?;
        Some((NodePath(rest.to_vec()), *last))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

impl TreeNode {
    /// Create an empty XML element.
    pub fn element(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Element,
            attributes: IndexMap::new(),
            children: Vec::new(),
            text: None,
            line: None,
        }
    }

    /// Create an XML comment.
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            kind: NodeKind::Comment,
            attributes: IndexMap::new(),
            children: Vec::new(),
            text: Some(text.into()),
            line: None,
        }
    }

    /// Create an empty JSON object node.
    pub fn object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Object,
            attributes: IndexMap::new(),
            children: Vec::new(),
            text: None,
            line: None,
        }
    }

    /// Create an empty JSON array node.
    pub fn array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Array,
            attributes: IndexMap::new(),
            children: Vec::new(),
            text: None,
            line: None,
        }
    }

    /// Create a JSON scalar node. `Null` scalars carry no text.
    pub fn scalar(name: impl Into<String>, scalar: ScalarType, text: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Scalar(scalar),
            attributes: IndexMap::new(),
            children: Vec::new(),
            text,
            line: None,
        }
    }

    /// Convenience for a JSON string member.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::String, Some(value.into()))
    }

    /// Builder: set an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: set text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Builder: append a child.
    pub fn with_child(mut self, child: TreeNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_element(&self) -> bool {
        self.kind == NodeKind::Element
    }

    pub fn is_json(&self) -> bool {
        match self.kind {
            NodeKind::Element | NodeKind::Comment => false,
            NodeKind::Object | NodeKind::Array | NodeKind::Scalar(_) => true,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Remove an attribute, keeping the order of the others.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attributes.shift_remove(name)
    }

    /// Text value, or the empty string.
    pub fn value(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn set_value(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut TreeNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// All children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TreeNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Index of the first child matching the predicate.
    pub fn position(&self, pred: impl Fn(&TreeNode) -> bool) -> Option<usize> {
        self.children.iter().position(pred)
    }

    /// Index of the last child matching the predicate.
    pub fn rposition(&self, pred: impl Fn(&TreeNode) -> bool) -> Option<usize> {
        self.children.iter().rposition(pred)
    }

    /// Remove every direct child matching the predicate, returning them in order.
    pub fn remove_children(&mut self, pred: impl Fn(&TreeNode) -> bool) -> Vec<TreeNode> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.children.len());
        for child in self.children.drain(..) {
            if pred(&child) {
                removed.push(child);
            } else {
                kept.push(child);
            }
        }
        self.children = kept;
        removed
    }

    /// Set or replace a JSON object member, keeping its position if it already exists.
    pub fn set_member(&mut self, member: TreeNode) {
        match self.children.iter_mut().find(|c| c.name == member.name) {
            Some(existing) => *existing = member,
            None => self.children.push(member),
        }
    }

    /// Resolve a node by path.
    pub fn get(&self, path: &NodePath) -> Option<&TreeNode> {
        let mut node = self;
        for &index in &path.0 {
            node = node.children.get(index)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &NodePath) -> Option<&mut TreeNode> {
        let mut node = self;
        for &index in &path.0 {
            node = node.children.get_mut(index)?;
        }
        Some(node)
    }

    /// Detach the node at `path`. The root cannot be removed.
    pub fn remove_at(&mut self, path: &NodePath) -> Option<TreeNode> {
        let (parent, index) = path.parent()?;
        let parent = self.get_mut(&parent)?;
        if index < parent.children.len() {
            Some(parent.children.remove(index))
        } else {
            None
        }
    }

    /// Pre-order walk over this node and all descendants, with their paths.
    pub fn walk(&self) -> Vec<(NodePath, &TreeNode)> {
        let mut out = Vec::new();
        let mut stack = vec![(NodePath::root(), self)];
        while let Some((path, node)) = stack.pop() {
            for (index, child) in node.children.iter().enumerate().rev() {
                stack.push((path.child(index), child));
            }
            out.push((path, node));
        }
        out
    }

    /// Paths of every descendant (excluding self) that satisfies the predicate.
    pub fn find_paths(&self, pred: impl Fn(&TreeNode) -> bool) -> Vec<NodePath> {
        self.walk()
            .into_iter()
            .filter(|(path, node)| !path.is_root() && pred(node))
            .map(|(path, _)| path)
            .collect()
    }
}
