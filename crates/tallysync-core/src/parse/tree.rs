//! XML element subtrees as generic JSON values.
//!
//! The shape follows the convention the rest of the dashboard already stores:
//! a leaf element without attributes is a bare string, anything else is an
//! object with attributes under `"$"`, text under `"_"` and one key per child
//! tag. A tag seen twice under the same parent becomes an array.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::error::AppError;

/// Key holding the attributes of an element.
pub const ATTR_KEY: &str = "$";
/// Key holding the text of an element that also has attributes or children.
pub const TEXT_KEY: &str = "_";

struct Frame {
    name: String,
    attrs: Map<String, Value>,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Self {
        Self {
            name: tag_name(start),
            attrs: attributes(start),
            children: Map::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> Value {
        let text = self.text.trim();
        if self.attrs.is_empty() && self.children.is_empty() {
            return Value::String(text.to_string());
        }
        let mut obj = self.children;
        if !self.attrs.is_empty() {
            obj.insert(ATTR_KEY.to_string(), Value::Object(self.attrs));
        }
        if !text.is_empty() {
            obj.insert(TEXT_KEY.to_string(), Value::String(text.to_string()));
        }
        Value::Object(obj)
    }
}

pub(crate) fn tag_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn attributes(start: &BytesStart<'_>) -> Map<String, Value> {
    let mut attrs = Map::new();
    for attr in start.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        attrs.insert(key, Value::String(value));
    }
    attrs
}

fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

/// Value of a self-closing element.
pub(crate) fn empty_element(start: &BytesStart<'_>) -> Value {
    Frame::open(start).into_value()
}

/// Reads the subtree of `start` (already consumed from `reader`) up to and
/// including its end tag.
pub(crate) fn read_element(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<Value, AppError> {
    let mut stack = vec![Frame::open(start)];

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AppError::XmlError(format!("at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => stack.push(Frame::open(&e)),
            Event::Empty(e) => {
                let name = tag_name(&e);
                let value = empty_element(&e);
                if let Some(parent) = stack.last_mut() {
                    insert_child(&mut parent.children, name, value);
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                let Some(frame) = stack.pop() else {
                    return Err(AppError::XmlError("unbalanced end tag".to_string()));
                };
                match stack.last_mut() {
                    Some(parent) => {
                        let name = frame.name.clone();
                        insert_child(&mut parent.children, name, frame.into_value());
                    }
                    None => return Ok(frame.into_value()),
                }
            }
            Event::Eof => {
                let open = stack.first().map(|f| f.name.as_str()).unwrap_or("?");
                return Err(AppError::XmlError(format!(
                    "document ended inside <{}>",
                    open
                )));
            }
            _ => {}
        }
    }
}

pub(crate) fn new_reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader
}

/// Parses a whole document into `{ ROOT_TAG: value }`.
pub fn parse_tree(xml: &str) -> Result<Value, AppError> {
    let mut reader = new_reader(xml);
    loop {
        match reader
            .read_event()
            .map_err(|e| AppError::XmlError(e.to_string()))?
        {
            Event::Start(e) => {
                let name = tag_name(&e);
                let value = read_element(&mut reader, &e)?;
                let mut root = Map::new();
                root.insert(name, value);
                return Ok(Value::Object(root));
            }
            Event::Empty(e) => {
                let mut root = Map::new();
                root.insert(tag_name(&e), empty_element(&e));
                return Ok(Value::Object(root));
            }
            Event::Eof => return Err(AppError::XmlError("document has no root element".to_string())),
            _ => {}
        }
    }
}
