//! Minimal owned XML tree used by every definition file.
//!
//! Definition files are small, so they are parsed whole into an [`XmlNode`]
//! tree with quick-xml and written back with an indenting writer.
//!
//! Definition files can be encoded in various formats:
//! - UTF-16 LE (with BOM 0xFF 0xFE)
//! - UTF-16 BE (with BOM 0xFE 0xFF)
//! - UTF-8 with BOM (0xEF 0xBB 0xBF)
//! - Plain UTF-8/ASCII
//!
//! quick-xml doesn't support UTF-16 directly, so the encoding is detected and
//! converted to UTF-8 using encoding_rs before parsing.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// UTF-16 LE BOM bytes
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];
/// UTF-16 BE BOM bytes
const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];
/// UTF-8 BOM bytes
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// XML parse/encode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XmlError {
    #[error("Malformed XML: {0}")]
    Malformed(String),

    #[error("Text encoding error: {0}")]
    Encoding(String),

    #[error("XML write error: {0}")]
    Write(String),
}

/// Detected encoding of an XML file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlEncoding {
    Utf16Le,
    Utf16Be,
    Utf8Bom,
    Utf8,
}

/// Detect the encoding of XML content by checking BOM bytes.
pub fn detect_encoding(bytes: &[u8]) -> XmlEncoding {
    if bytes.len() >= 2 && bytes[0..2] == UTF16_LE_BOM {
        XmlEncoding::Utf16Le
    } else if bytes.len() >= 2 && bytes[0..2] == UTF16_BE_BOM {
        XmlEncoding::Utf16Be
    } else if bytes.len() >= 3 && bytes[0..3] == UTF8_BOM {
        XmlEncoding::Utf8Bom
    } else {
        XmlEncoding::Utf8
    }
}

/// Decode XML bytes to UTF-8 string, handling various encodings.
pub fn decode_xml_bytes(bytes: &[u8]) -> Result<String, XmlError> {
    match detect_encoding(bytes) {
        XmlEncoding::Utf16Le => {
            let (cow, _, had_errors) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
            if had_errors {
                return Err(XmlError::Encoding("UTF-16 LE decoding error".to_string()));
            }
            Ok(cow.into_owned())
        }
        XmlEncoding::Utf16Be => {
            let (cow, _, had_errors) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
            if had_errors {
                return Err(XmlError::Encoding("UTF-16 BE decoding error".to_string()));
            }
            Ok(cow.into_owned())
        }
        XmlEncoding::Utf8Bom => String::from_utf8(bytes[3..].to_vec())
            .map_err(|_| XmlError::Encoding("Invalid UTF-8 after BOM".to_string())),
        XmlEncoding::Utf8 => String::from_utf8(bytes.to_vec())
            .map_err(|_| XmlError::Encoding("Invalid UTF-8 encoding".to_string())),
    }
}

/// One element of an XML tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Append a child and return a handle to it.
    pub fn add_child(&mut self, node: XmlNode) -> &mut XmlNode {
        self.children.push(node);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Replace the text of the named child, creating it if needed.
    pub fn set_child_text(&mut self, name: &str, text: impl Into<String>) -> &mut XmlNode {
        let text = text.into();
        if let Some(idx) = self.children.iter().position(|c| c.name == name) {
            self.children[idx].text = text;
            return &mut self.children[idx];
        }
        self.add_child(XmlNode::new(name).with_text(text))
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<XmlNode, XmlError> {
        let mut reader = Reader::from_str(xml);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Malformed(format!("{} at byte {}", e, reader.buffer_position())))?;
            match event {
                Event::Eof => break,
                Event::Start(ref e) => {
                    let node = element_from_start(e)?;
                    if stack.is_empty() && root.is_some() {
                        return Err(XmlError::Malformed("multiple root elements".to_string()));
                    }
                    stack.push(node);
                }
                Event::Empty(ref e) => {
                    let node = element_from_start(e)?;
                    close_element(node, &mut stack, &mut root)?;
                }
                Event::End(ref e) => {
                    let name = std::str::from_utf8(e.name().as_ref())
                        .map_err(|e| XmlError::Malformed(e.to_string()))?
                        .to_string();
                    let mut node = stack
                        .pop()
                        .ok_or_else(|| XmlError::Malformed(format!("unexpected </{}>", name)))?;
                    if node.name != name {
                        return Err(XmlError::Malformed(format!(
                            "expected </{}>, found </{}>",
                            node.name, name
                        )));
                    }
                    node.text = node.text.trim().to_string();
                    close_element(node, &mut stack, &mut root)?;
                }
                Event::Text(ref t) => {
                    let raw = String::from_utf8_lossy(t);
                    let text = quick_xml::escape::unescape(&raw)
                        .map_err(|e| XmlError::Malformed(e.to_string()))?;
                    push_text(&mut stack, &text)?;
                }
                Event::CData(ref c) => {
                    let text = String::from_utf8_lossy(c);
                    push_text(&mut stack, &text)?;
                }
                Event::GeneralRef(ref r) => {
                    let name = String::from_utf8_lossy(r);
                    let resolved = resolve_reference(&name).ok_or_else(|| {
                        XmlError::Malformed(format!("unknown entity &{};", name))
                    })?;
                    push_text(&mut stack, &resolved)?;
                }
                // Declarations, comments, processing instructions, doctype.
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(XmlError::Malformed(format!("unclosed element <{}>", open.name)));
        }
        root.ok_or_else(|| XmlError::Malformed("no root element".to_string()))
    }

    /// Serialize this node as a complete UTF-8 document.
    pub fn to_document(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| XmlError::Write(e.to_string()))?;
        write_node(&mut writer, self)?;
        let mut out = String::from_utf8(writer.into_inner())
            .map_err(|e| XmlError::Write(e.to_string()))?;
        out.push('\n');
        Ok(out)
    }
}

fn element_from_start(e: &BytesStart<'_>) -> Result<XmlNode, XmlError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|e| XmlError::Malformed(e.to_string()))?
        .to_string();
    let mut node = XmlNode::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmlError::Malformed(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Malformed(e.to_string()))?
            .to_string();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn close_element(
    node: XmlNode,
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(XmlError::Malformed("multiple root elements".to_string())),
    }
}

fn push_text(stack: &mut [XmlNode], text: &str) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(node) => {
            node.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(XmlError::Malformed("text outside root element".to_string())),
    }
}

/// Resolve a predefined entity or character reference (without `&` and `;`).
fn resolve_reference(name: &str) -> Option<String> {
    let predefined = match name {
        "amp" => Some("&"),
        "lt" => Some("<"),
        "gt" => Some(">"),
        "quot" => Some("\""),
        "apos" => Some("'"),
        _ => None,
    };
    if let Some(value) = predefined {
        return Some(value.to_string());
    }
    let code = name.strip_prefix('#')?;
    let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => code.parse::<u32>().ok()?,
    };
    char::from_u32(value).map(|c| c.to_string())
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &XmlNode) -> Result<(), XmlError> {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if node.children.is_empty() && node.text.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| XmlError::Write(e.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| XmlError::Write(e.to_string()))?;
    if !node.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&node.text)))
            .map_err(|e| XmlError::Write(e.to_string()))?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(|e| XmlError::Write(e.to_string()))
}
