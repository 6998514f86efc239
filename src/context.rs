//! Session and stream state shared between the connection handler and the
//! stream processor that currently owns the wire.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::framing::{StanzaReader, StanzaWriter, StreamEvent};
use crate::handler::RunningState;
use crate::stanza::Packet;
use crate::xml::{ns, Element};

/// A bidirectional byte stream the engine can run XMPP over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

type Reader = StanzaReader<ReadHalf<BoxedTransport>>;
type Writer = StanzaWriter<WriteHalf<BoxedTransport>>;

/// Writer half shared by the stream context and the packet sender.
pub(crate) type SharedWriter = Arc<Mutex<Option<Writer>>>;

/// Identity negotiated for the current connection attempt.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub host_name: String,
    pub stream_id: Option<String>,
    pub version: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Requested resource before binding, bound resource afterwards.
    pub resource: Option<String>,
    pub jid: Option<String>,
    pub secure: bool,
    pub authenticated: bool,
}

impl SessionContext {
    pub fn reset(&mut self) {
        *self = SessionContext::default();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("host_name", &self.host_name)
            .field("stream_id", &self.stream_id)
            .field("version", &self.version)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("resource", &self.resource)
            .field("jid", &self.jid)
            .field("secure", &self.secure)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// Features advertised in the last `<stream:features/>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    pub starttls: bool,
    pub starttls_required: bool,
    pub bind: bool,
    pub session: bool,
    pub mechanisms: Vec<String>,
    /// Anything else, as (namespace, local name).
    pub others: Vec<(String, String)>,
}

impl StreamFeatures {
    pub fn from_element(el: &Element) -> Self {
        let mut features = StreamFeatures::default();
        for child in el.children() {
            match (child.ns(), child.name()) {
                (ns::TLS, "starttls") => {
                    features.starttls = true;
                    features.starttls_required = child.has_child("required", ns::TLS);
                }
                (ns::SASL, "mechanisms") => {
                    features.mechanisms = child
                        .children()
                        .filter(|m| m.is("mechanism", ns::SASL))
                        .map(|m| m.text().trim().to_string())
                        .collect();
                }
                (ns::BIND, "bind") => features.bind = true,
                (ns::SESSION, "session") => features.session = true,
                (namespace, name) => features.others.push((namespace.to_string(), name.to_string())),
            }
        }
        features
    }

    pub fn supports_mechanism(&self, mechanism: &str) -> bool {
        self.mechanisms.iter().any(|m| m == mechanism)
    }
}

fn shut_down() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "connection handler shut down",
    ))
}

fn not_attached() -> Error {
    Error::protocol("no transport attached")
}

/// Live reader/writer plus negotiated features.
pub struct StreamContext {
    reader: Option<Reader>,
    writer: SharedWriter,
    pub features: StreamFeatures,
    stop: Option<watch::Receiver<RunningState>>,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            reader: None,
            writer: Arc::new(Mutex::new(None)),
            features: StreamFeatures::default(),
            stop: None,
        }
    }

    /// Reads made through [`next_event`](Self::next_event) fail once `state` reports Stopped.
    pub(crate) fn watch_state(&mut self, state: watch::Receiver<RunningState>) {
        self.stop = Some(state);
    }

    pub(crate) fn writer_handle(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    pub fn is_attached(&self) -> bool {
        self.reader.is_some()
    }

    /// Bind a transport, replacing any previous one.
    pub async fn attach(&mut self, transport: BoxedTransport) {
        let (read, write) = tokio::io::split(transport);
        self.reader = Some(StanzaReader::new(read));
        *self.writer.lock().await = Some(StanzaWriter::new(write));
    }

    /// Take the transport back, e.g. to wrap it in TLS.
    pub async fn detach(&mut self) -> Result<BoxedTransport> {
        let reader = self.reader.take().ok_or_else(not_attached)?;
        let writer = self.writer.lock().await.take().ok_or_else(not_attached)?;
        if reader.has_buffered_data() {
            return Err(Error::protocol("unexpected data buffered before transport upgrade"));
        }
        Ok(reader.into_inner().unsplit(writer.into_inner()))
    }

    /// Read without regard to the handler state. Cancel-safe.
    pub(crate) async fn read_event(&mut self) -> Result<Option<StreamEvent>> {
        self.reader.as_mut().ok_or_else(not_attached)?.next_event().await
    }

    pub(crate) fn push_back(&mut self, event: StreamEvent) {
        if let Some(reader) = self.reader.as_mut() {
            reader.push_back(event);
        }
    }

    /// Next stream event; aborted when the handler shuts down.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        let reader = self.reader.as_mut().ok_or_else(not_attached)?;
        let Some(stop) = self.stop.as_mut() else {
            return reader.next_event().await;
        };
        tokio::select! {
            biased;
            _ = stop.wait_for(|s| *s == RunningState::Stopped) => Err(shut_down()),
            event = reader.next_event() => event,
        }
    }

    /// Next child element of the stream.
    pub async fn next_element(&mut self) -> Result<Element> {
        match self.next_event().await? {
            Some(StreamEvent::Element(el)) => Ok(el),
            Some(StreamEvent::Open(_)) => Err(Error::protocol("unexpected stream header")),
            Some(StreamEvent::Close) | None => Err(Error::protocol("stream closed by remote")),
        }
    }

    pub async fn open_stream(&self, to: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        guard.as_mut().ok_or_else(not_attached)?.open_stream(to).await
    }

    pub async fn send_element(&self, element: &Element) -> Result<()> {
        let mut guard = self.writer.lock().await;
        guard.as_mut().ok_or_else(not_attached)?.write_element(element).await
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let mut guard = self.writer.lock().await;
        guard.as_mut().ok_or_else(not_attached)?.write_packet(packet).await
    }

    /// Drop reader and writer and forget negotiated features.
    pub async fn reset(&mut self) {
        self.reader = None;
        *self.writer.lock().await = None;
        self.features = StreamFeatures::default();
    }

    /// Send `</stream:stream>` and shut the transport down. Errors are logged only.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close_stream().await {
                debug!(error = %e, "Failed to send stream end");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Failed to shut transport down");
            }
        }
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn assert_send<T: Send>(_: &T) {}
    fn assert_sync<T: Sync>() {}

    #[tokio::test]
    async fn test_stream_context_futures_are_send() {
        assert_sync::<StreamContext>();
        let (transport, _server) = tokio::io::duplex(1024);
        let mut stream = StreamContext::new();
        stream.attach(Box::new(transport)).await;
        let element = Element::new("presence", ns::CLIENT);
        assert_send(&stream.send_element(&element));
        assert_send(&stream.open_stream("example.com"));
    }

    #[test]
    fn test_features_parse() {
        let el = crate::xml::parse(
            "<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism></mechanisms>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             <sm xmlns='urn:xmpp:sm:3'/>\
             </stream:features>",
            &crate::xml::NamespaceScope::client_stream(),
        )
        .unwrap();
        let features = StreamFeatures::from_element(&el);
        assert!(features.starttls);
        assert!(features.starttls_required);
        assert!(features.bind);
        assert!(!features.session);
        assert!(features.supports_mechanism("PLAIN"));
        assert_eq!(features.others, vec![("urn:xmpp:sm:3".to_string(), "sm".to_string())]);
    }

    #[test]
    fn test_session_debug_redacts_password() {
        let session = SessionContext {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let printed = format!("{:?}", session);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_attach_detach_round_trip() {
        let (mut server, client) = tokio::io::duplex(1024);
        let mut stream = StreamContext::new();
        stream.attach(Box::new(client)).await;
        assert!(stream.is_attached());

        let mut transport = stream.detach().await.unwrap();
        assert!(!stream.is_attached());
        assert!(stream.send_element(&Element::new("presence", ns::CLIENT)).await.is_err());

        transport.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_next_event_aborts_on_stop() {
        let (_server, client) = tokio::io::duplex(1024);
        let (state_tx, state_rx) = watch::channel(RunningState::Handshaking);
        let mut stream = StreamContext::new();
        stream.attach(Box::new(client)).await;
        stream.watch_state(state_rx);

        let pending = tokio::spawn(async move { stream.next_event().await });
        tokio::task::yield_now().await;
        state_tx.send_replace(RunningState::Stopped);
        assert!(pending.await.unwrap().is_err());
    }
}
