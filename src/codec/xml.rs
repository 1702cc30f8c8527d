use super::{CodecError, LineEnding, TextLayout};
use crate::models::{NodeKind, TreeNode};
use quick_xml::Reader;
use quick_xml::escape::partial_escape;
use quick_xml::events::Event;

const INDENT: &str = "  ";

/// Counts newlines incrementally so element line numbers stay O(n) overall.
struct LineTracker<'a> {
    text: &'a str,
    offset: usize,
    line: usize,
}

impl<'a> LineTracker<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            offset: 0,
            line: 1,
        }
    }

    fn advance(&mut self, position: usize) -> usize {
        let end = position.min(self.text.len());
        if end > self.offset {
            self.line += self.text.as_bytes()[self.offset..end]
                .iter()
                .filter(|b| **b == b'\n')
                .count();
            self.offset = end;
        }
        self.line
    }
}

fn element_from(
    start: &quick_xml::events::BytesStart<'_>,
    line: usize,
) -> Result<TreeNode, CodecError> {
    let mut node = TreeNode::element(String::from_utf8_lossy(start.name().as_ref()));
    node.line = Some(line);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| CodecError::Xml {
            line,
            message: e.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| CodecError::Xml {
            line,
            message: e.to_string(),
        })?;
        node.attributes.insert(key, value.into_owned());
    }
    Ok(node)
}

fn append_text(node: &mut TreeNode, text: &str) {
    match node.text.as_mut() {
        Some(existing) => existing.push_str(text),
        None => node.text = Some(text.to_string()),
    }
}

/// Parse an XML document into its root element.
pub fn parse(text: &str) -> Result<(TreeNode, TextLayout), CodecError> {
    let body = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut lines = LineTracker::new(body);
    let mut layout = TextLayout {
        line_ending: LineEnding::detect(body),
        trailing_newline: body.ends_with('\n'),
        ..TextLayout::default()
    };
    let mut stack: Vec<TreeNode> = Vec::new();
    let mut root: Option<TreeNode> = None;

    loop {
        let event = reader.read_event().map_err(|e| CodecError::Xml {
            line: lines.advance(reader.buffer_position() as usize),
            message: e.to_string(),
        })?;
        let line = lines.advance(reader.buffer_position() as usize);

        match event {
            Event::Decl(decl) => {
                layout.declaration = Some(format!(
                    "<?{}?>",
                    String::from_utf8_lossy(&decl).trim()
                ));
            }
            Event::Start(start) => {
                stack.push(element_from(&start, line)?);
            }
            Event::Empty(start) => {
                let node = element_from(&start, line)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                let node = match stack.pop() {
                    Some(node) if node.name == name => node,
                    _ => return Err(CodecError::Unbalanced { name, line }),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(content) => {
                let value = content.unescape().map_err(|e| CodecError::Xml {
                    line,
                    message: e.to_string(),
                })?;
                if let Some(node) = stack.last_mut() {
                    append_text(node, &value);
                }
            }
            Event::CData(content) => {
                let value = String::from_utf8_lossy(&content).into_owned();
                if let Some(node) = stack.last_mut() {
                    append_text(node, &value);
                }
            }
            Event::Comment(content) => {
                let value = String::from_utf8_lossy(&content).into_owned();
                match stack.last_mut() {
                    Some(parent) => {
                        let mut comment = TreeNode::comment(value);
                        comment.line = Some(line);
                        parent.children.push(comment);
                    }
                    None if root.is_none() => layout.prolog_comments.push(value),
                    None => {}
                }
            }
            Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(open) = stack.pop() {
        return Err(CodecError::Xml {
            line: lines.line,
            message: format!("element <{}> is never closed", open.name),
        });
    }
    let root = root.ok_or(CodecError::MissingRoot)?;
    Ok((root, layout))
}

fn escape_attr(value: &str) -> String {
    partial_escape(value).replace('"', "&quot;")
}

fn write_node(node: &TreeNode, depth: usize, eol: &str, out: &mut String) {
    let indent = INDENT.repeat(depth);
    match node.kind {
        NodeKind::Comment => {
            out.push_str(&indent);
            out.push_str("<!--");
            out.push_str(node.value());
            out.push_str("-->");
            out.push_str(eol);
        }
        NodeKind::Element => {
            out.push_str(&indent);
            out.push('<');
            out.push_str(&node.name);
            for (key, value) in &node.attributes {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
            let text = node.text.as_deref().filter(|t| !t.is_empty());
            match (text, node.children.is_empty()) {
                (None, true) => {
                    out.push_str(" />");
                    out.push_str(eol);
                }
                (Some(text), true) => {
                    out.push('>');
                    out.push_str(&partial_escape(text));
                    out.push_str("</");
                    out.push_str(&node.name);
                    out.push('>');
                    out.push_str(eol);
                }
                (text, false) => {
                    out.push('>');
                    out.push_str(eol);
                    if let Some(text) = text {
                        out.push_str(&INDENT.repeat(depth + 1));
                        out.push_str(&partial_escape(text));
                        out.push_str(eol);
                    }
                    for child in &node.children {
                        write_node(child, depth + 1, eol, out);
                    }
                    out.push_str(&indent);
                    out.push_str("</");
                    out.push_str(&node.name);
                    out.push('>');
                    out.push_str(eol);
                }
            }
        }
        // JSON kinds never appear in XML trees; written as nothing.
        NodeKind::Object | NodeKind::Array | NodeKind::Scalar(_) => {}
    }
}

/// Write a single element (and its subtree) without declaration.
pub fn write_fragment(node: &TreeNode, line_ending: LineEnding) -> String {
    let eol = line_ending.as_str();
    let mut out = String::new();
    write_node(node, 0, eol, &mut out);
    if out.ends_with(eol) {
        out.truncate(out.len() - eol.len());
    }
    out
}

/// Write a whole document.
pub fn write(root: &TreeNode, layout: &TextLayout) -> Result<String, CodecError> {
    if root.kind != NodeKind::Element {
        return Err(CodecError::WrongKind {
            kind: root.kind,
            format: super::DocumentFormat::Xml,
        });
    }
    let eol = layout.line_ending.as_str();
    let mut out = String::new();
    if let Some(decl) = &layout.declaration {
        out.push_str(decl);
        out.push_str(eol);
    }
    for comment in &layout.prolog_comments {
        out.push_str("<!--");
        out.push_str(comment);
        out.push_str("-->");
        out.push_str(eol);
    }
    out.push_str(&write_fragment(root, layout.line_ending));
    if layout.trailing_newline {
        out.push_str(eol);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROJECT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Project DefaultTargets="Build" xmlns="http://schemas.microsoft.com/developer/msbuild/2003">
  <!--generated-->
  <PropertyGroup Condition="'$(Configuration)|$(Platform)'=='Debug|x64'">
    <OutDir>bin\</OutDir>
  </PropertyGroup>
  <Import Project="$(VCTargetsPath)\Microsoft.Cpp.targets" />
</Project>"#;

    #[test]
    fn test_parse_structure() {
        let (root, layout) = parse(PROJECT).unwrap();
        assert_eq!(root.name, "Project");
        assert_eq!(
            layout.declaration.as_deref(),
            Some(r#"<?xml version="1.0" encoding="utf-8"?>"#)
        );
        assert_eq!(root.children.len(), 3);
        assert_eq!(root.children[0].kind, NodeKind::Comment);
        let group = &root.children[1];
        assert_eq!(
            group.attr("Condition"),
            Some("'$(Configuration)|$(Platform)'=='Debug|x64'")
        );
        assert_eq!(group.child("OutDir").unwrap().value(), "bin\\");
    }

    #[test]
    fn test_line_numbers() {
        let (root, _) = parse(PROJECT).unwrap();
        assert_eq!(root.children[1].line, Some(4));
        assert_eq!(root.children[2].line, Some(7));
    }

    #[test]
    fn test_write_is_stable() {
        let (root, layout) = parse(PROJECT).unwrap();
        let text = write(&root, &layout).unwrap();
        assert_eq!(text, PROJECT);
    }

    #[test]
    fn test_crlf_preserved() {
        let crlf = PROJECT.replace('\n', "\r\n");
        let (root, layout) = parse(&crlf).unwrap();
        assert_eq!(layout.line_ending, LineEnding::CrLf);
        assert_eq!(write(&root, &layout).unwrap(), crlf);
    }

    #[test]
    fn test_escaping() {
        let node = TreeNode::element("Message")
            .with_attr("Text", "a \"b\" & <c>")
            .with_text("x < y");
        assert_eq!(
            write_fragment(&node, LineEnding::Lf),
            "<Message Text=\"a &quot;b&quot; &amp; &lt;c&gt;\">x &lt; y</Message>"
        );
    }

    #[test]
    fn test_unbalanced_is_error() {
        let err = parse("<A><B></A>").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Unbalanced { .. } | CodecError::Xml { .. }
        ));
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(parse("<!-- only -->"), Err(CodecError::MissingRoot)));
    }
}
