//! Typed stanzas exchanged over the stream.
//!
//! [`Packet`] is a tagged union; [`PacketKind`] is its discriminant, with a
//! sub-tag for IQ payloads so a reply can be re-wrapped into the kind of the
//! request it answers (see [`Iq::recast`]).

mod error;
mod iq;
mod roster;

pub use error::{condition, ErrorType, StanzaError, StreamError};
pub use iq::{Bind, Iq, IqKind, IqPayload, IqType};
pub use roster::{RosterItem, RosterQuery, Subscription};

use crate::error::{Error, Result};
use crate::xml::{ns, Element};

/// Addressing attributes shared by every stanza.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StanzaAttrs {
    pub id: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub lang: Option<String>,
}

impl StanzaAttrs {
    fn from_element(el: &Element) -> Self {
        StanzaAttrs {
            id: el.attr("id").map(str::to_string),
            to: el.attr("to").map(str::to_string),
            from: el.attr("from").map(str::to_string),
            lang: el.attr("xml:lang").map(str::to_string),
        }
    }

    fn write_to(&self, el: &mut Element) {
        el.set_attr("id", self.id.clone());
        el.set_attr("to", self.to.clone());
        el.set_attr("from", self.from.clone());
        el.set_attr("xml:lang", self.lang.clone());
    }
}

/// Text child carrying an optional `xml:lang`, like `<body/>` or `<subject/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LangText {
    pub lang: Option<String>,
    pub text: String,
}

impl LangText {
    fn from_element(el: &Element) -> Self {
        LangText {
            lang: el.attr("xml:lang").map(str::to_string),
            text: el.text(),
        }
    }

    fn to_element(&self, name: &str) -> Element {
        let mut el = Element::new(name, ns::CLIENT).with_text(self.text.clone());
        el.set_attr("xml:lang", self.lang.clone());
        el
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub attrs: StanzaAttrs,
    pub message_type: Option<String>,
    pub bodies: Vec<LangText>,
    pub subjects: Vec<LangText>,
    pub thread: Option<String>,
    /// Children outside `jabber:client` (chat states, receipts, ...).
    pub extensions: Vec<Element>,
    pub error: Option<StanzaError>,
}

impl Message {
    pub fn chat(to: impl Into<String>, body: impl Into<String>) -> Self {
        Message {
            attrs: StanzaAttrs {
                to: Some(to.into()),
                ..Default::default()
            },
            message_type: Some("chat".to_string()),
            bodies: vec![LangText {
                lang: None,
                text: body.into(),
            }],
            ..Default::default()
        }
    }

    /// No body, subject, thread or extension: nothing a client could act on.
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
            && self.subjects.is_empty()
            && self.thread.is_none()
            && self.extensions.is_empty()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        let mut message = Message {
            attrs: StanzaAttrs::from_element(el),
            message_type: el.attr("type").map(str::to_string),
            ..Default::default()
        };
        for child in el.children() {
            if child.ns() != ns::CLIENT {
                message.extensions.push(child.clone());
                continue;
            }
            match child.name() {
                "body" => message.bodies.push(LangText::from_element(child)),
                "subject" => message.subjects.push(LangText::from_element(child)),
                "thread" => message.thread = Some(child.text()),
                "error" => message.error = Some(StanzaError::from_element(child)?),
                _ => {}
            }
        }
        Ok(message)
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("message", ns::CLIENT);
        self.attrs.write_to(&mut el);
        el.set_attr("type", self.message_type.clone());
        for subject in &self.subjects {
            el.append_child(subject.to_element("subject"));
        }
        for body in &self.bodies {
            el.append_child(body.to_element("body"));
        }
        if let Some(thread) = &self.thread {
            el.append_child(Element::new("thread", ns::CLIENT).with_text(thread.clone()));
        }
        for ext in &self.extensions {
            el.append_child(ext.clone());
        }
        if let Some(error) = &self.error {
            el.append_child(error.to_element());
        }
        el
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub attrs: StanzaAttrs,
    pub presence_type: Option<String>,
    pub show: Option<String>,
    pub status: Option<String>,
    pub priority: Option<i8>,
    pub extensions: Vec<Element>,
    pub error: Option<StanzaError>,
}

impl Presence {
    /// Initial available presence.
    pub fn available() -> Self {
        Presence::default()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        let mut presence = Presence {
            attrs: StanzaAttrs::from_element(el),
            presence_type: el.attr("type").map(str::to_string),
            ..Default::default()
        };
        for child in el.children() {
            if child.ns() != ns::CLIENT {
                presence.extensions.push(child.clone());
                continue;
            }
            match child.name() {
                "show" => presence.show = Some(child.text()),
                "status" => presence.status = Some(child.text()),
                "priority" => {
                    let text = child.text();
                    let priority = text
                        .trim()
                        .parse()
                        .map_err(|_| Error::protocol(format!("invalid presence priority '{}'", text)))?;
                    presence.priority = Some(priority);
                }
                "error" => presence.error = Some(StanzaError::from_element(child)?),
                _ => {}
            }
        }
        Ok(presence)
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("presence", ns::CLIENT);
        self.attrs.write_to(&mut el);
        el.set_attr("type", self.presence_type.clone());
        if let Some(show) = &self.show {
            el.append_child(Element::new("show", ns::CLIENT).with_text(show.clone()));
        }
        if let Some(status) = &self.status {
            el.append_child(Element::new("status", ns::CLIENT).with_text(status.clone()));
        }
        if let Some(priority) = self.priority {
            el.append_child(Element::new("priority", ns::CLIENT).with_text(priority.to_string()));
        }
        for ext in &self.extensions {
            el.append_child(ext.clone());
        }
        if let Some(error) = &self.error {
            el.append_child(error.to_element());
        }
        el
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Message,
    Presence,
    Iq(IqKind),
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
    /// Pre-serialized markup written to the wire as is.
    Raw(String),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Message(_) => PacketKind::Message,
            Packet::Presence(_) => PacketKind::Presence,
            Packet::Iq(iq) => PacketKind::Iq(iq.kind()),
            Packet::Raw(_) => PacketKind::Raw,
        }
    }

    fn attrs(&self) -> Option<&StanzaAttrs> {
        match self {
            Packet::Message(m) => Some(&m.attrs),
            Packet::Presence(p) => Some(&p.attrs),
            Packet::Iq(iq) => Some(&iq.attrs),
            Packet::Raw(_) => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.attrs().and_then(|a| a.id.as_deref())
    }

    /// Raw packets have no id to set; the call is ignored for them.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let attrs = match self {
            Packet::Message(m) => &mut m.attrs,
            Packet::Presence(p) => &mut p.attrs,
            Packet::Iq(iq) => &mut iq.attrs,
            Packet::Raw(_) => return,
        };
        attrs.id = Some(id.into());
    }

    pub fn sender(&self) -> Option<&str> {
        self.attrs().and_then(|a| a.from.as_deref())
    }

    /// Re-wrap an IQ reply into the kind of the request it answers.
    pub fn recast(self, kind: PacketKind) -> Packet {
        match (self, kind) {
            (Packet::Iq(iq), PacketKind::Iq(iq_kind)) => Packet::Iq(iq.recast(iq_kind)),
            (packet, _) => packet,
        }
    }
}

impl From<Message> for Packet {
    fn from(m: Message) -> Self {
        Packet::Message(m)
    }
}

impl From<Presence> for Packet {
    fn from(p: Presence) -> Self {
        Packet::Presence(p)
    }
}

impl From<Iq> for Packet {
    fn from(iq: Iq) -> Self {
        Packet::Iq(iq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{parse, NamespaceScope};

    fn element(xml: &str) -> Element {
        parse(xml, &NamespaceScope::client_stream()).unwrap()
    }

    #[test]
    fn test_empty_message_detection() {
        let empty = Message::from_element(&element("<message from='a@b' id='1'/>")).unwrap();
        assert!(empty.is_empty());

        let unknown_client_child =
            Message::from_element(&element("<message from='a@b'><foo/></message>")).unwrap();
        assert!(unknown_client_child.is_empty());

        let chat_state = Message::from_element(&element(
            "<message from='a@b'><composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
        ))
        .unwrap();
        assert!(!chat_state.is_empty());

        let thread = Message::from_element(&element("<message><thread>t1</thread></message>")).unwrap();
        assert!(!thread.is_empty());

        let error_only = Message::from_element(&element(
            "<message id='e1' type='error'><error type='cancel'>\
             <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></message>",
        ))
        .unwrap();
        assert!(error_only.error.is_some());
        assert!(error_only.is_empty());
    }

    #[test]
    fn test_message_serialization() {
        let mut message = Message::chat("juliet@example.com", "Art thou not Romeo?");
        message.attrs.id = Some("m1".to_string());
        assert_eq!(
            message.to_element().to_xml(ns::CLIENT),
            "<message id='m1' to='juliet@example.com' type='chat'><body>Art thou not Romeo?</body></message>"
        );
    }

    #[test]
    fn test_presence_parse() {
        let presence = Presence::from_element(&element(
            "<presence from='a@b/c'><show>away</show><status>out</status><priority>-1</priority></presence>",
        ))
        .unwrap();
        assert_eq!(presence.show.as_deref(), Some("away"));
        assert_eq!(presence.status.as_deref(), Some("out"));
        assert_eq!(presence.priority, Some(-1));
    }

    #[test]
    fn test_presence_invalid_priority() {
        assert!(Presence::from_element(&element("<presence><priority>high</priority></presence>")).is_err());
    }

    #[test]
    fn test_packet_ids() {
        let mut packet = Packet::from(Presence::available());
        assert_eq!(packet.id(), None);
        packet.set_id("p1");
        assert_eq!(packet.id(), Some("p1"));

        let mut raw = Packet::Raw("<presence/>".to_string());
        raw.set_id("ignored");
        assert_eq!(raw.id(), None);
        assert_eq!(raw.kind(), PacketKind::Raw);
    }

    #[test]
    fn test_packet_sender() {
        let presence = Presence::from_element(&element("<presence from='a@b/c'/>")).unwrap();
        let packet = Packet::from(presence);
        assert_eq!(packet.sender(), Some("a@b/c"));
        assert_eq!(Packet::from(Presence::available()).sender(), None);
        assert_eq!(Packet::Raw("<presence/>".to_string()).sender(), None);
    }

    #[test]
    fn test_packet_recast_only_touches_iq() {
        let presence = Packet::from(Presence::available());
        assert_eq!(presence.clone().recast(PacketKind::Iq(IqKind::Roster)), presence);

        let reply = Packet::from(Iq::new(IqType::Result, IqPayload::Generic(None)));
        assert_eq!(
            reply.recast(PacketKind::Iq(IqKind::Roster)).kind(),
            PacketKind::Iq(IqKind::Roster)
        );
    }
}
