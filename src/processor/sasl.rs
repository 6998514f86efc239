use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

use super::{read_response, StreamProcessor};
use crate::context::{SessionContext, StreamContext};
use crate::error::{Error, Result};
use crate::xml::{ns, Element};

/// SASL PLAIN authentication (RFC 4616).
///
/// Run with `redo_handshake` set: a successful exchange requires a stream restart.
pub struct SaslPlainStream;

fn credentials(session: &SessionContext) -> Result<(&str, &str)> {
    let username = session
        .username
        .as_deref()
        .ok_or_else(|| Error::Config("SASL PLAIN requires a username".to_string()))?;
    let password = session
        .password
        .as_deref()
        .ok_or_else(|| Error::Config("SASL PLAIN requires a password".to_string()))?;
    Ok((username, password))
}

#[async_trait]
impl StreamProcessor for SaslPlainStream {
    async fn process(&self, session: &mut SessionContext, stream: &mut StreamContext) -> Result<()> {
        if !stream.features.supports_mechanism("PLAIN") {
            return Err(Error::AuthFailed(format!(
                "server does not offer PLAIN (offered: {:?})",
                stream.features.mechanisms
            )));
        }
        if !session.secure {
            warn!(host = %session.host_name, "Sending PLAIN credentials over an unencrypted stream");
        }

        let payload = {
            let (username, password) = credentials(session)?;
            BASE64.encode(format!("\0{}\0{}", username, password))
        };
        let auth = Element::new("auth", ns::SASL)
            .with_attr("mechanism", "PLAIN")
            .with_text(payload);
        stream.send_element(&auth).await?;

        let response = read_response(stream, "SASL").await?;
        if response.is("success", ns::SASL) {
            session.authenticated = true;
            session.stream_id = None;
            info!(host = %session.host_name, username = ?session.username, "Authenticated");
            return Ok(());
        }
        if response.is("failure", ns::SASL) {
            let condition = response
                .children()
                .find(|c| c.name() != "text")
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let text = response.get_child("text", ns::SASL).map(Element::text);
            return Err(Error::AuthFailed(match text {
                Some(text) => format!("{}: {}", condition, text),
                None => condition,
            }));
        }
        Err(Error::protocol(format!("unexpected SASL response <{}/>", response.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamFeatures;
    use crate::testing::attached_stream;

    fn session() -> SessionContext {
        SessionContext {
            host_name: "example.com".to_string(),
            username: Some("juliet".to_string()),
            password: Some("r0m30".to_string()),
            ..Default::default()
        }
    }

    fn plain_features() -> StreamFeatures {
        StreamFeatures {
            mechanisms: vec!["SCRAM-SHA-1".to_string(), "PLAIN".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sasl_plain_success() {
        let (mut stream, mut server) = attached_stream().await;
        stream.features = plain_features();
        server.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;

        let mut session = session();
        SaslPlainStream.process(&mut session, &mut stream).await.unwrap();
        assert!(session.authenticated);

        let auth = server.expect_element().await;
        assert!(auth.is("auth", ns::SASL));
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        assert_eq!(BASE64.decode(auth.text()).unwrap(), b"\0juliet\0r0m30");
    }

    #[tokio::test]
    async fn test_sasl_plain_failure_condition() {
        let (mut stream, mut server) = attached_stream().await;
        stream.features = plain_features();
        server
            .send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>Invalid username or password</text></failure>")
            .await;

        match SaslPlainStream.process(&mut session(), &mut stream).await {
            Err(Error::AuthFailed(reason)) => {
                assert_eq!(reason, "not-authorized: Invalid username or password")
            }
            other => panic!("expected auth failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sasl_plain_not_offered() {
        let (mut stream, _server) = attached_stream().await;
        stream.features.mechanisms = vec!["SCRAM-SHA-1".to_string()];
        assert!(matches!(
            SaslPlainStream.process(&mut session(), &mut stream).await,
            Err(Error::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sasl_plain_requires_password() {
        let (mut stream, _server) = attached_stream().await;
        stream.features = plain_features();
        let mut session = session();
        session.password = None;
        assert!(matches!(
            SaslPlainStream.process(&mut session, &mut stream).await,
            Err(Error::Config(_))
        ));
    }
}
