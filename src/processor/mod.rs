//! In-band negotiation steps run against the shared session and stream context.
//!
//! A processor owns the wire for the duration of [`StreamProcessor::process`]:
//! either before the read loop starts (initial handshake, STARTTLS) or while
//! the connection handler is paused (see
//! [`ConnectionHandler::process_stream`](crate::handler::ConnectionHandler::process_stream)).

mod bind;
mod handshake;
mod sasl;
mod starttls;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{SessionContext, StreamContext};
use crate::error::{Error, Result};
use crate::stanza::StreamError;
use crate::xml::{ns, Element};

pub use bind::ResourceBindingStream;
pub use handshake::HandshakeStream;
pub use sasl::SaslPlainStream;
pub use starttls::StartTlsStream;

/// Upper bound for a single server response during negotiation.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait StreamProcessor: Send + Sync {
    async fn process(&self, session: &mut SessionContext, stream: &mut StreamContext) -> Result<()>;
}

/// Processors the connection handler runs on its own.
#[derive(Clone)]
pub struct StreamProcessors {
    pub handshake: Arc<dyn StreamProcessor>,
    /// Run when the server offers STARTTLS.
    pub tls: Option<Arc<dyn StreamProcessor>>,
}

impl Default for StreamProcessors {
    fn default() -> Self {
        Self {
            handshake: Arc::new(HandshakeStream),
            tls: Some(Arc::new(StartTlsStream)),
        }
    }
}

impl StreamProcessors {
    /// Never upgrades to TLS. Servers that require STARTTLS are rejected.
    pub fn plaintext() -> Self {
        Self {
            handshake: Arc::new(HandshakeStream),
            tls: None,
        }
    }
}

/// Read the next element with [`NEGOTIATION_TIMEOUT`], turning `<stream:error/>` into an error.
pub(crate) async fn read_response(stream: &mut StreamContext, step: &str) -> Result<Element> {
    let element = tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.next_element())
        .await
        .map_err(|_| Error::Timeout(format!("waiting for {} response", step)))??;
    if element.is("error", ns::STREAM) {
        return Err(Error::Stream(StreamError::from_element(&element)));
    }
    Ok(element)
}
