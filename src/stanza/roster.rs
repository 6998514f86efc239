//! `jabber:iq:roster` payload (RFC 6121 section 2).

use crate::error::{Error, Result};
use crate::xml::{ns, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            "remove" => Ok(Subscription::Remove),
            other => Err(Error::protocol(format!("invalid roster subscription '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RosterItem {
    pub jid: String,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// `ask='subscribe'`: an outbound subscription request is pending.
    pub pending_out: bool,
    pub groups: Vec<String>,
}

impl RosterItem {
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            ..Default::default()
        }
    }

    fn from_element(el: &Element) -> Result<Self> {
        let jid = el
            .attr("jid")
            .ok_or_else(|| Error::protocol("roster item without jid"))?
            .to_string();
        let subscription = match el.attr("subscription") {
            Some(s) => Subscription::parse(s)?,
            None => Subscription::None,
        };
        Ok(RosterItem {
            jid,
            name: el.attr("name").map(str::to_string),
            subscription,
            pending_out: el.attr("ask") == Some("subscribe"),
            groups: el
                .children()
                .filter(|c| c.is("group", ns::ROSTER))
                .map(|c| c.text())
                .collect(),
        })
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("item", ns::ROSTER).with_attr("jid", self.jid.clone());
        if let Some(name) = &self.name {
            el.set_attr("name", Some(name.clone()));
        }
        if self.subscription != Subscription::None {
            el.set_attr("subscription", Some(self.subscription.as_str().to_string()));
        }
        if self.pending_out {
            el.set_attr("ask", Some("subscribe".to_string()));
        }
        for group in &self.groups {
            el.append_child(Element::new("group", ns::ROSTER).with_text(group.clone()));
        }
        el
    }
}

/// `<query xmlns='jabber:iq:roster'/>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RosterQuery {
    pub ver: Option<String>,
    pub items: Vec<RosterItem>,
}

impl RosterQuery {
    pub fn from_element(el: &Element) -> Result<Self> {
        if !el.is("query", ns::ROSTER) {
            return Err(Error::protocol("not a roster query"));
        }
        let items = el
            .children()
            .filter(|c| c.is("item", ns::ROSTER))
            .map(RosterItem::from_element)
            .collect::<Result<Vec<_>>>()?;
        Ok(RosterQuery {
            ver: el.attr("ver").map(str::to_string),
            items,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("query", ns::ROSTER);
        if let Some(ver) = &self.ver {
            el.set_attr("ver", Some(ver.clone()));
        }
        for item in &self.items {
            el.append_child(item.to_element());
        }
        el
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{parse, NamespaceScope};

    #[test]
    fn test_roster_query_parse() {
        let el = parse(
            "<query xmlns='jabber:iq:roster' ver='v1'>\
             <item jid='romeo@example.net' name='Romeo' subscription='both'><group>Friends</group></item>\
             <item jid='nurse@example.com' ask='subscribe'/>\
             </query>",
            &NamespaceScope::client_stream(),
        )
        .unwrap();
        let query = RosterQuery::from_element(&el).unwrap();
        assert_eq!(query.ver.as_deref(), Some("v1"));
        assert_eq!(query.items.len(), 2);
        assert_eq!(query.items[0].subscription, Subscription::Both);
        assert_eq!(query.items[0].groups, vec!["Friends".to_string()]);
        assert!(query.items[1].pending_out);
        assert_eq!(query.items[1].subscription, Subscription::None);
    }

    #[test]
    fn test_roster_item_requires_jid() {
        let el = Element::new("query", ns::ROSTER).with_child(Element::new("item", ns::ROSTER));
        assert!(RosterQuery::from_element(&el).is_err());
    }

    #[test]
    fn test_roster_item_serializes_pending_subscription() {
        let mut item = RosterItem::new("juliet@example.com");
        item.pending_out = true;
        let query = RosterQuery {
            ver: None,
            items: vec![item],
        };
        assert_eq!(
            query.to_element().to_xml(ns::CLIENT),
            "<query xmlns='jabber:iq:roster'><item jid='juliet@example.com' ask='subscribe'/></query>"
        );
    }
}
