//! Minimal namespace-aware XML element tree.
//!
//! Stanzas arrive as standalone fragments cut out of the stream by
//! [`crate::framing`]. Their namespace context (the `jabber:client` default and
//! the `stream` prefix) is declared on the `<stream:stream>` header, so fragments
//! are parsed against an inherited [`NamespaceScope`].

use std::collections::HashMap;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// Namespaces used by the stream engine.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const STREAMS_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const ROSTER: &str = "jabber:iq:roster";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: ns.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, Some(value.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns == ns
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or (with `None`) remove an attribute.
    pub fn set_attr(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        self.attrs.retain(|(k, _)| *k != key);
        if let Some(value) = value {
            self.attrs.push((key, value));
        }
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, skipping text nodes.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, ns))
    }

    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize, declaring `xmlns` only where it differs from `parent_ns`.
    pub fn to_xml(&self, parent_ns: &str) -> String {
        let mut out = String::new();
        self.write_into(&mut out, parent_ns);
        out
    }

    fn write_into(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.ns != parent_ns {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.ns.as_str()));
            out.push('\'');
        }
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_into(out, &self.ns),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// In-scope namespace declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceScope {
    default: Option<String>,
    prefixes: HashMap<String, String>,
}

impl NamespaceScope {
    /// The scope a client-to-server stream header normally establishes.
    pub fn client_stream() -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("stream".to_string(), ns::STREAM.to_string());
        Self {
            default: Some(ns::CLIENT.to_string()),
            prefixes,
        }
    }

    pub fn default_ns(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub(crate) fn declare(&mut self, key: &str, value: &str) -> bool {
        if key == "xmlns" {
            self.default = Some(value.to_string());
            true
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            self.prefixes.insert(prefix.to_string(), value.to_string());
            true
        } else {
            false
        }
    }

    fn resolve(&self, prefix: Option<&str>) -> Result<String> {
        match prefix {
            None => Ok(self.default.clone().unwrap_or_default()),
            Some("xml") => Ok(ns::XML.to_string()),
            Some(p) => self
                .prefixes
                .get(p)
                .cloned()
                .ok_or_else(|| Error::protocol(format!("undeclared namespace prefix '{}'", p))),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Build an element from a start tag, returning it with the scope its children inherit.
fn open_element(start: &BytesStart<'_>, parent: &NamespaceScope) -> Result<(Element, NamespaceScope)> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = lossy(attr.key.as_ref());
        let value = attr.unescape_value()?.into_owned();
        if !scope.declare(&key, &value) {
            attrs.push((key, value));
        }
    }

    let qname = start.name();
    let prefix = qname.prefix().map(|p| lossy(p.as_ref()));
    let ns = scope.resolve(prefix.as_deref())?;
    let element = Element {
        name: lossy(qname.local_name().as_ref()),
        ns,
        attrs,
        children: Vec::new(),
    };
    Ok((element, scope))
}

/// Parse one complete element. Leading declarations, comments and whitespace are skipped.
pub fn parse(xml: &str, scope: &NamespaceScope) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<(Element, NamespaceScope)> = Vec::new();

    fn attach(stack: &mut [(Element, NamespaceScope)], element: Element) -> Option<Element> {
        match stack.last_mut() {
            Some((parent, _)) => {
                parent.children.push(Node::Element(element));
                None
            }
            None => Some(element),
        }
    }

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let current = stack.last().map(|(_, s)| s).unwrap_or(scope);
                let opened = open_element(&e, current)?;
                stack.push(opened);
            }
            Event::Empty(e) => {
                let current = stack.last().map(|(_, s)| s).unwrap_or(scope);
                let (element, _) = open_element(&e, current)?;
                if let Some(done) = attach(&mut stack, element) {
                    return Ok(done);
                }
            }
            Event::End(_) => {
                let (element, _) = stack
                    .pop()
                    .ok_or_else(|| Error::protocol("unbalanced end tag"))?;
                if let Some(done) = attach(&mut stack, element) {
                    return Ok(done);
                }
            }
            Event::Text(t) => {
                if let Some((parent, _)) = stack.last_mut() {
                    let text = t.unescape()?;
                    if !text.is_empty() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
            }
            Event::CData(c) => {
                if let Some((parent, _)) = stack.last_mut() {
                    parent.children.push(Node::Text(lossy(&c.into_inner())));
                }
            }
            Event::Eof => return Err(Error::protocol("incomplete XML element")),
            _ => {}
        }
    }
}
