use std::fmt;

use crate::error::{Error, Result};
use crate::xml::{ns, Element};

/// Defined stanza error conditions used by the engine.
pub mod condition {
    pub const BAD_REQUEST: &str = "bad-request";
    pub const CONFLICT: &str = "conflict";
    pub const FEATURE_NOT_IMPLEMENTED: &str = "feature-not-implemented";
    pub const ITEM_NOT_FOUND: &str = "item-not-found";
    pub const NOT_ALLOWED: &str = "not-allowed";
    pub const SERVICE_UNAVAILABLE: &str = "service-unavailable";
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(ErrorType::Auth),
            "cancel" => Some(ErrorType::Cancel),
            "continue" => Some(ErrorType::Continue),
            "modify" => Some(ErrorType::Modify),
            "wait" => Some(ErrorType::Wait),
            _ => None,
        }
    }
}

/// `<error/>` child of a stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: String,
    pub text: Option<String>,
    pub by: Option<String>,
    pub app_condition: Option<Element>,
}

impl StanzaError {
    pub fn new(error_type: ErrorType, condition: impl Into<String>) -> Self {
        Self {
            error_type,
            condition: condition.into(),
            text: None,
            by: None,
            app_condition: None,
        }
    }

    pub fn from_element(el: &Element) -> Result<Self> {
        let error_type = el
            .attr("type")
            .and_then(ErrorType::parse)
            .ok_or_else(|| Error::protocol("stanza error without a valid type"))?;

        let mut error = StanzaError::new(error_type, condition::UNDEFINED_CONDITION);
        error.by = el.attr("by").map(str::to_string);
        for child in el.children() {
            if child.ns() == ns::STANZAS {
                if child.name() == "text" {
                    error.text = Some(child.text());
                } else {
                    error.condition = child.name().to_string();
                }
            } else {
                error.app_condition = Some(child.clone());
            }
        }
        Ok(error)
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("error", ns::CLIENT).with_attr("type", self.error_type.as_str());
        if let Some(by) = &self.by {
            el.set_attr("by", Some(by.clone()));
        }
        el.append_child(Element::new(self.condition.clone(), ns::STANZAS));
        if let Some(text) = &self.text {
            el.append_child(Element::new("text", ns::STANZAS).with_text(text.clone()));
        }
        if let Some(app) = &self.app_condition {
            el.append_child(app.clone());
        }
        el
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type.as_str())?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

/// Remote `<stream:error/>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: String,
    pub text: Option<String>,
    pub text_lang: Option<String>,
    pub app_condition: Option<Element>,
}

impl StreamError {
    pub fn from_element(el: &Element) -> Self {
        let mut error = StreamError {
            condition: "undefined-condition".to_string(),
            text: None,
            text_lang: None,
            app_condition: None,
        };
        for child in el.children() {
            match (child.ns(), child.name()) {
                (ns::STREAMS_ERROR, "text") => {
                    error.text = Some(child.text());
                    error.text_lang = child.attr("xml:lang").map(str::to_string);
                }
                (ns::STREAMS_ERROR, name) => error.condition = name.to_string(),
                _ => error.app_condition = Some(child.clone()),
            }
        }
        error
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.condition)?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}
