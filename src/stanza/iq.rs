use crate::error::{Error, Result};
use crate::xml::{ns, Element};

use super::error::{ErrorType, StanzaError};
use super::roster::RosterQuery;
use super::StanzaAttrs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(Error::protocol(format!("invalid iq type '{}'", other))),
        }
    }

    /// `get` and `set` expect a reply; `result` and `error` are replies.
    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

/// Payload discriminant used for reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Generic,
    Bind,
    Roster,
}

/// Resource binding payload (RFC 6120 section 7).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bind {
    pub resource: Option<String>,
    pub jid: Option<String>,
}

impl Bind {
    pub fn from_element(el: &Element) -> Self {
        Bind {
            resource: el.get_child("resource", ns::BIND).map(Element::text),
            jid: el.get_child("jid", ns::BIND).map(Element::text),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("bind", ns::BIND);
        if let Some(resource) = &self.resource {
            el.append_child(Element::new("resource", ns::BIND).with_text(resource.clone()));
        }
        if let Some(jid) = &self.jid {
            el.append_child(Element::new("jid", ns::BIND).with_text(jid.clone()));
        }
        el
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqPayload {
    /// Any payload without a dedicated type, or none at all.
    Generic(Option<Element>),
    Bind(Bind),
    Roster(RosterQuery),
}

impl IqPayload {
    pub fn kind(&self) -> IqKind {
        match self {
            IqPayload::Generic(_) => IqKind::Generic,
            IqPayload::Bind(_) => IqKind::Bind,
            IqPayload::Roster(_) => IqKind::Roster,
        }
    }

    fn from_element(el: &Element) -> Result<Self> {
        Ok(match (el.ns(), el.name()) {
            (ns::BIND, "bind") => IqPayload::Bind(Bind::from_element(el)),
            (ns::ROSTER, "query") => IqPayload::Roster(RosterQuery::from_element(el)?),
            _ => IqPayload::Generic(Some(el.clone())),
        })
    }

    fn to_element(&self) -> Option<Element> {
        match self {
            IqPayload::Generic(el) => el.clone(),
            IqPayload::Bind(bind) => Some(bind.to_element()),
            IqPayload::Roster(query) => Some(query.to_element()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    pub attrs: StanzaAttrs,
    pub iq_type: IqType,
    pub payload: IqPayload,
    pub error: Option<StanzaError>,
}

impl Iq {
    pub fn new(iq_type: IqType, payload: IqPayload) -> Self {
        Self {
            attrs: StanzaAttrs::default(),
            iq_type,
            payload,
            error: None,
        }
    }

    pub fn get(payload: IqPayload) -> Self {
        Self::new(IqType::Get, payload)
    }

    pub fn set(payload: IqPayload) -> Self {
        Self::new(IqType::Set, payload)
    }

    pub fn kind(&self) -> IqKind {
        self.payload.kind()
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        let iq_type = IqType::parse(el.attr("type").unwrap_or_default())?;
        let mut payload = IqPayload::Generic(None);
        let mut error = None;
        for child in el.children() {
            if child.is("error", ns::CLIENT) {
                error = Some(StanzaError::from_element(child)?);
            } else if matches!(payload, IqPayload::Generic(None)) {
                payload = IqPayload::from_element(child)?;
            }
        }
        Ok(Iq {
            attrs: StanzaAttrs::from_element(el),
            iq_type,
            payload,
            error,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("iq", ns::CLIENT);
        self.attrs.write_to(&mut el);
        el.set_attr("type", Some(self.iq_type.as_str().to_string()));
        if let Some(payload) = self.payload.to_element() {
            el.append_child(payload);
        }
        if let Some(error) = &self.error {
            el.append_child(error.to_element());
        }
        el
    }

    /// Re-wrap this IQ's payload as `kind`, keeping addressing, type and error.
    ///
    /// Only a generic payload is converted: a reply that already carries a
    /// typed payload, or a request for the generic kind, is returned unchanged.
    /// A generic payload that cannot be read as `kind` becomes an empty one.
    pub fn recast(self, kind: IqKind) -> Iq {
        if kind == IqKind::Generic {
            return self;
        }
        let IqPayload::Generic(element) = &self.payload else {
            return self;
        };
        let payload = match kind {
            IqKind::Generic => IqPayload::Generic(element.clone()),
            IqKind::Bind => IqPayload::Bind(
                element
                    .as_ref()
                    .filter(|e| e.is("bind", ns::BIND))
                    .map(Bind::from_element)
                    .unwrap_or_default(),
            ),
            IqKind::Roster => IqPayload::Roster(
                element
                    .as_ref()
                    .and_then(|e| RosterQuery::from_element(e).ok())
                    .unwrap_or_default(),
            ),
        };
        Iq { payload, ..self }
    }

    /// An error reply to this request: same id, addressed back to the sender.
    ///
    /// The request payload is not echoed.
    pub fn error_reply(&self, condition: &str, error_type: ErrorType) -> Iq {
        Iq {
            attrs: StanzaAttrs {
                id: self.attrs.id.clone(),
                to: self.attrs.from.clone(),
                from: None,
                lang: None,
            },
            iq_type: IqType::Error,
            payload: IqPayload::Generic(None),
            error: Some(StanzaError::new(error_type, condition)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::condition;
    use crate::stanza::roster::RosterItem;
    use crate::xml::{parse, NamespaceScope};

    fn iq(xml: &str) -> Iq {
        Iq::from_element(&parse(xml, &NamespaceScope::client_stream()).unwrap()).unwrap()
    }

    #[test]
    fn test_iq_parse_detects_payload_kind() {
        assert_eq!(
            iq("<iq type='result' id='1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>a@b/r</jid></bind></iq>").kind(),
            IqKind::Bind
        );
        assert_eq!(
            iq("<iq type='result' id='2'><query xmlns='jabber:iq:roster'/></iq>").kind(),
            IqKind::Roster
        );
        assert_eq!(
            iq("<iq type='get' id='3'><ping xmlns='urn:xmpp:ping'/></iq>").kind(),
            IqKind::Generic
        );
    }

    #[test]
    fn test_iq_parse_reads_error() {
        let parsed = iq("<iq type='error' id='1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><error type='modify'><bad-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>");
        assert_eq!(parsed.iq_type, IqType::Error);
        let error = parsed.error.unwrap();
        assert_eq!(error.condition, condition::BAD_REQUEST);
        assert_eq!(error.error_type, ErrorType::Modify);
    }

    #[test]
    fn test_iq_invalid_type_is_rejected() {
        let el = Element::new("iq", ns::CLIENT).with_attr("type", "fetch");
        assert!(Iq::from_element(&el).is_err());
    }

    #[test]
    fn test_recast_empty_result_to_roster() {
        let reply = iq("<iq type='result' id='id_001' from='example.com'/>");
        let recast = reply.recast(IqKind::Roster);
        assert_eq!(recast.kind(), IqKind::Roster);
        assert_eq!(recast.iq_type, IqType::Result);
        assert_eq!(recast.attrs.id.as_deref(), Some("id_001"));
        assert_eq!(recast.attrs.from.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_recast_keeps_error_and_typed_payload() {
        let reply = iq("<iq type='error' id='x'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>");
        let recast = reply.recast(IqKind::Bind);
        assert_eq!(recast.kind(), IqKind::Bind);
        assert_eq!(recast.error.unwrap().condition, condition::ITEM_NOT_FOUND);

        let mut query = RosterQuery::default();
        query.items.push(RosterItem::new("a@b"));
        let typed = Iq::new(IqType::Result, IqPayload::Roster(query.clone()));
        assert_eq!(typed.recast(IqKind::Bind).payload, IqPayload::Roster(query));
    }

    #[test]
    fn test_error_reply_addresses_sender() {
        let request = iq("<iq type='get' id='id_001' from='a@b' to='me@c/r'><foo xmlns='urn:example'/></iq>");
        let reply = request.error_reply(condition::SERVICE_UNAVAILABLE, ErrorType::Cancel);
        assert_eq!(
            reply.to_element().to_xml(ns::CLIENT),
            "<iq id='id_001' to='a@b' type='error'><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
        );
    }
}
