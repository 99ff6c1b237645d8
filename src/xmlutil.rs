//! Minimal owned XML document model over quick-xml.
//!
//! The ledger documents and the per-dataset knowledge bases are small XML
//! files, so they are parsed whole into an [`Element`] tree and rewritten in
//! full on every mutation. Writes go through a temp file in the same
//! directory followed by an atomic rename so a crash never leaves a partial
//! document behind.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One XML element: tag, attributes in document order, child elements and
/// directly contained text (trimmed, concatenated).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    /// Direct children with the given tag.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// First direct child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// Text of the first direct child with the given tag.
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).map(|c| c.text.as_str())
    }

    /// Follows a `/`-separated path of child tags and returns the text of the
    /// final element, e.g. `text_at("VALUE/MEANING")`.
    pub fn text_at(&self, path: &str) -> Option<&str> {
        let mut cur = self;
        for tag in path.split('/') {
            cur = cur.child(tag)?;
        }
        Some(cur.text.as_str())
    }

    /// All elements of the subtree rooted here, excluding `self`, in document
    /// order.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = Vec::new();
        let mut stack: Vec<&Element> = self.children.iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Builds an alias→element index over direct children with the given
    /// tag, keyed by their `alias` attribute.
    pub fn alias_index(&self, tag: &str) -> HashMap<String, Element> {
        self.children_named(tag)
            .filter_map(|c| c.attr("alias").map(|a| (a.to_string(), c.clone())))
            .collect()
    }
}

/// Parses a whole XML document into its root element.
pub fn read_document(path: &Path) -> Result<Element> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read XML document {}", path.display()))?;
    parse_document(&content).with_context(|| format!("parse XML document {}", path.display()))
}

pub fn parse_document(content: &str) -> Result<Element> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                let elem = element_from_start(&start)?;
                attach(&mut stack, &mut root, elem)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(text.unescape()?.trim());
                }
            }
            Event::End(_) => {
                let elem = stack.pop().context("unbalanced XML end tag")?;
                attach(&mut stack, &mut root, elem)?;
            }
            Event::Eof => break,
            // Declaration, comments and processing instructions are skipped.
            _ => {}
        }
    }

    root.context("XML document has no root element")
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let mut elem = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr?;
        elem.attrs.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value()?.into_owned(),
        ));
    }
    Ok(elem)
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, elem: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(elem),
        None => {
            anyhow::ensure!(root.is_none(), "XML document has multiple root elements");
            *root = Some(elem);
        }
    }
    Ok(())
}

/// Serializes the element tree with an XML declaration and tab indentation.
pub fn to_bytes(root: &Element) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    write_element(&mut writer, root)?;
    Ok(writer.into_inner())
}

fn write_element(writer: &mut Writer<Vec<u8>>, elem: &Element) -> Result<()> {
    let mut start = BytesStart::new(elem.tag.as_str());
    for (key, value) in &elem.attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if elem.children.is_empty() && elem.text.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    if !elem.text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(&elem.text)))?;
    }
    for child in &elem.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(elem.tag.as_str())))?;
    Ok(())
}

/// Writes the document durably: temp file in the target directory, fsync,
/// then rename over the destination.
pub fn write_document(path: &Path, root: &Element) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let bytes = to_bytes(root)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file next to {}", path.display()))?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
