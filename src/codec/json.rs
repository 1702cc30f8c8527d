use super::{CodecError, DocumentFormat, LineEnding, TextLayout};
use crate::models::{NodeKind, ScalarType, TreeNode};
use serde_json::{Map, Number, Value};

/// Convert a JSON value into a tree node named `name`.
pub fn from_value(name: &str, value: &Value) -> TreeNode {
    match value {
        Value::Object(map) => {
            let mut node = TreeNode::object(name);
            for (key, member) in map {
                node.children.push(from_value(key, member));
            }
            node
        }
        Value::Array(items) => {
            let mut node = TreeNode::array(name);
            for item in items {
                node.children.push(from_value("", item));
            }
            node
        }
        Value::String(s) => TreeNode::scalar(name, ScalarType::String, Some(s.clone())),
        Value::Number(n) => TreeNode::scalar(name, ScalarType::Number, Some(n.to_string())),
        Value::Bool(b) => TreeNode::scalar(name, ScalarType::Bool, Some(b.to_string())),
        Value::Null => TreeNode::scalar(name, ScalarType::Null, None),
    }
}

/// Convert a tree node back into a JSON value.
pub fn to_value(node: &TreeNode) -> Result<Value, CodecError> {
    match node.kind {
        NodeKind::Object => {
            let mut map = Map::new();
            for child in &node.children {
                map.insert(child.name.clone(), to_value(child)?);
            }
            Ok(Value::Object(map))
        }
        NodeKind::Array => node
            .children
            .iter()
            .map(to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        NodeKind::Scalar(ScalarType::String) => Ok(Value::String(node.value().to_string())),
        NodeKind::Scalar(ScalarType::Number) => {
            let number = node.value().parse::<Number>()?;
            Ok(Value::Number(number))
        }
        NodeKind::Scalar(ScalarType::Bool) => Ok(Value::Bool(node.value() == "true")),
        NodeKind::Scalar(ScalarType::Null) => Ok(Value::Null),
        NodeKind::Element | NodeKind::Comment => Err(CodecError::WrongKind {
            kind: node.kind,
            format: DocumentFormat::Json,
        }),
    }
}

pub fn parse(text: &str) -> Result<(TreeNode, TextLayout), CodecError> {
    let body = text.strip_prefix('\u{feff}').unwrap_or(text);
    let value: Value = serde_json::from_str(body)?;
    let layout = TextLayout {
        line_ending: LineEnding::detect(body),
        trailing_newline: body.ends_with('\n'),
        ..TextLayout::default()
    };
    Ok((from_value("", &value), layout))
}

/// Indented JSON with `\n` line endings.
pub fn to_pretty(node: &TreeNode) -> Result<String, CodecError> {
    let value = to_value(node)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

pub fn write(root: &TreeNode, layout: &TextLayout) -> Result<String, CodecError> {
    let mut text = to_pretty(root)?;
    if layout.line_ending == LineEnding::CrLf {
        text = text.replace('\n', "\r\n");
    }
    if layout.trailing_newline {
        text.push_str(layout.line_ending.as_str());
    }
    Ok(text)
}
