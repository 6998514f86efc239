use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{read_response, StreamProcessor};
use crate::context::{SessionContext, StreamContext};
use crate::error::{Error, Result};
use crate::stanza::{condition, Bind, ErrorType, Iq, IqPayload, IqType, Packet, StanzaError};
use crate::xml::ns;

static NEXT_BIND_ID: AtomicU64 = AtomicU64::new(1);

/// Resource binding (RFC 6120 section 7).
///
/// Requests `session.resource` when set, otherwise lets the server pick.
/// Stores the bound full JID and resource in the session.
pub struct ResourceBindingStream;

fn resource_of(jid: &str) -> Option<&str> {
    jid.split_once('/').map(|(_, resource)| resource)
}

#[async_trait]
impl StreamProcessor for ResourceBindingStream {
    async fn process(&self, session: &mut SessionContext, stream: &mut StreamContext) -> Result<()> {
        if !stream.features.bind {
            debug!("Server does not offer resource binding");
            return Ok(());
        }

        let id = format!("bind_{}", NEXT_BIND_ID.fetch_add(1, Ordering::Relaxed));
        let mut request = Iq::set(IqPayload::Bind(Bind {
            resource: session.resource.clone(),
            jid: None,
        }));
        request.attrs.id = Some(id.clone());
        stream.send_packet(&Packet::Iq(request)).await?;

        let element = loop {
            let element = read_response(stream, "bind").await?;
            if element.is("iq", ns::CLIENT) && element.attr("id") == Some(id.as_str()) {
                break element;
            }
            debug!(element = element.name(), "Ignoring element while binding");
        };

        let reply = Iq::from_element(&element)?;
        match (reply.iq_type, reply.payload) {
            (IqType::Result, IqPayload::Bind(Bind { jid: Some(jid), .. })) => {
                session.resource = resource_of(&jid).map(str::to_string);
                info!(jid = %jid, "Resource bound");
                session.jid = Some(jid);
                Ok(())
            }
            (IqType::Result, _) => Err(Error::protocol("bind result without a jid")),
            (IqType::Error, _) => Err(Error::StanzaError(reply.error.unwrap_or_else(|| {
                StanzaError::new(ErrorType::Cancel, condition::UNDEFINED_CONDITION)
            }))),
            (other, _) => Err(Error::protocol(format!("unexpected bind reply type '{}'", other.as_str()))),
        }
    }
}
