//! Error taxonomy for the stream engine.

use crate::stanza::{StanzaError, StreamError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any failure while negotiating the stream (handshake, STARTTLS, re-handshake).
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] Box<Error>),

    /// The remote entity sent `<stream:error/>`; the stream is unusable.
    #[error("stream error: {0}")]
    Stream(StreamError),

    /// A negotiation step was answered with an IQ of type "error".
    #[error("stanza error: {0}")]
    StanzaError(StanzaError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    /// The packet queue was stopped before the packet was sent or answered.
    #[error("packet queue stopped")]
    QueueStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Whether this error means the stream framing can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Stream(_) | Error::Xml(_) | Error::Protocol(_) | Error::Io(_) | Error::Tls(_)
        )
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Error::Xml(quick_xml::Error::InvalidAttr(e))
    }
}
