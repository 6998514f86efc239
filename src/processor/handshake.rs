use async_trait::async_trait;
use tracing::debug;

use super::{read_response, StreamProcessor, NEGOTIATION_TIMEOUT};
use crate::context::{SessionContext, StreamContext, StreamFeatures};
use crate::error::{Error, Result};
use crate::framing::StreamEvent;
use crate::stanza::StreamError;
use crate::xml::ns;

/// Opens the stream and records the server header and features.
///
/// Also used to restart the stream after STARTTLS or authentication.
pub struct HandshakeStream;

#[async_trait]
impl StreamProcessor for HandshakeStream {
    async fn process(&self, session: &mut SessionContext, stream: &mut StreamContext) -> Result<()> {
        stream.open_stream(&session.host_name).await?;

        let event = tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.next_event())
            .await
            .map_err(|_| Error::Timeout("waiting for stream header".to_string()))??;
        let header = match event {
            Some(StreamEvent::Open(header)) => header,
            Some(StreamEvent::Element(el)) if el.is("error", ns::STREAM) => {
                return Err(Error::Stream(StreamError::from_element(&el)));
            }
            Some(StreamEvent::Element(el)) => {
                return Err(Error::protocol(format!("expected stream header, got <{}/>", el.name())));
            }
            Some(StreamEvent::Close) | None => {
                return Err(Error::protocol("stream closed before header"));
            }
        };

        session.stream_id = header.id;
        session.version = header.version;

        // Pre-1.0 servers send no features
        if session.version.is_none() {
            stream.features = StreamFeatures::default();
            return Ok(());
        }

        let features = read_response(stream, "stream features").await?;
        if !features.is("features", ns::STREAM) {
            return Err(Error::protocol(format!("expected stream features, got <{}/>", features.name())));
        }
        stream.features = StreamFeatures::from_element(&features);
        debug!(
            stream_id = ?session.stream_id,
            starttls = stream.features.starttls,
            bind = stream.features.bind,
            mechanisms = ?stream.features.mechanisms,
            "Stream negotiated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attached_stream, SERVER_HEADER};

    #[tokio::test]
    async fn test_handshake_reads_header_and_features() {
        let (mut stream, mut server) = attached_stream().await;
        let mut session = SessionContext {
            host_name: "example.com".to_string(),
            ..Default::default()
        };

        server
            .send(&format!(
                "{}<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
                SERVER_HEADER
            ))
            .await;
        HandshakeStream.process(&mut session, &mut stream).await.unwrap();

        let header = server.expect_header().await;
        assert_eq!(header.to.as_deref(), Some("example.com"));
        assert_eq!(session.stream_id.as_deref(), Some("s1"));
        assert_eq!(session.version.as_deref(), Some("1.0"));
        assert!(stream.features.starttls);
        assert!(stream.features.bind);
    }

    #[tokio::test]
    async fn test_handshake_stream_error() {
        let (mut stream, mut server) = attached_stream().await;
        let mut session = SessionContext::default();
        server
            .send(&format!(
                "{}<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
                SERVER_HEADER
            ))
            .await;
        match HandshakeStream.process(&mut session, &mut stream).await {
            Err(Error::Stream(e)) => assert_eq!(e.condition, "host-unknown"),
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_rejects_closed_stream() {
        let (mut stream, server) = attached_stream().await;
        let mut session = SessionContext::default();
        drop(server);
        assert!(HandshakeStream.process(&mut session, &mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_pre_version_server_has_no_features() {
        let (mut stream, mut server) = attached_stream().await;
        let mut session = SessionContext::default();
        server
            .send("<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='old'>")
            .await;
        HandshakeStream.process(&mut session, &mut stream).await.unwrap();
        assert_eq!(session.stream_id.as_deref(), Some("old"));
        assert_eq!(stream.features, StreamFeatures::default());
        server.expect_header().await;
    }
}
