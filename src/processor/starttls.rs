use async_trait::async_trait;
use tracing::{debug, info};

use super::{read_response, StreamProcessor};
use crate::connector::tls;
use crate::context::{SessionContext, StreamContext, StreamFeatures};
use crate::error::{Error, Result};
use crate::xml::{ns, Element};

/// STARTTLS (RFC 6120 section 5): request, wait for `<proceed/>`, then
/// run the TLS handshake over the existing transport.
///
/// The stream must be restarted afterwards; the connection handler does
/// that by running the handshake processor again.
pub struct StartTlsStream;

#[async_trait]
impl StreamProcessor for StartTlsStream {
    async fn process(&self, session: &mut SessionContext, stream: &mut StreamContext) -> Result<()> {
        stream.send_element(&Element::new("starttls", ns::TLS)).await?;
        debug!(host = %session.host_name, "STARTTLS: Sent <starttls/> request");

        let response = read_response(stream, "STARTTLS").await?;
        if response.is("failure", ns::TLS) {
            return Err(Error::Tls("server rejected STARTTLS".to_string()));
        }
        if !response.is("proceed", ns::TLS) {
            return Err(Error::protocol(format!(
                "unexpected STARTTLS response <{}/> (expected <proceed/>)",
                response.name()
            )));
        }
        info!(host = %session.host_name, "STARTTLS: Received <proceed/>, upgrading to TLS");

        let transport = stream.detach().await?;
        let upgraded = tls::upgrade(transport, &session.host_name).await?;
        stream.attach(Box::new(upgraded)).await;

        session.secure = true;
        session.stream_id = None;
        session.version = None;
        stream.features = StreamFeatures::default();
        info!(host = %session.host_name, "STARTTLS: TLS handshake complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::attached_stream;

    fn session() -> SessionContext {
        SessionContext {
            host_name: "example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_starttls_failure_response() {
        let (mut stream, mut server) = attached_stream().await;
        server.send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;

        let result = StartTlsStream.process(&mut session(), &mut stream).await;
        assert!(matches!(result, Err(Error::Tls(_))));

        let request = server.expect_element().await;
        assert!(request.is("starttls", ns::TLS));
    }

    #[tokio::test]
    async fn test_starttls_unexpected_response() {
        let (mut stream, mut server) = attached_stream().await;
        server.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        let result = StartTlsStream.process(&mut session(), &mut stream).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_starttls_handshake_failure_after_proceed() {
        tls::set_dangerous_insecure_tls(true);
        let (mut stream, mut server) = attached_stream().await;
        server.send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;

        let mut session = session();
        let upgrade = tokio::spawn(async move {
            let result = StartTlsStream.process(&mut session, &mut stream).await;
            (result, session)
        });

        let _ = server.expect_element().await;
        // Answer the ClientHello with plaintext
        server.send("<not-tls/>").await;
        let (result, session) = upgrade.await.unwrap();
        assert!(result.is_err());
        assert!(!session.secure);
    }
}
