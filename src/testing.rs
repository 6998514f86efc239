//! In-memory server side of a stream for unit tests.

use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::context::{BoxedTransport, StreamContext};
use crate::framing::{StanzaReader, StreamEvent, StreamHeader};
use crate::xml::Element;

pub(crate) const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream from='example.com' id='s1' version='1.0' xml:lang='en' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

const WAIT: Duration = Duration::from_secs(5);

pub(crate) struct FakeServer {
    reader: StanzaReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    pub(crate) async fn send(&mut self, xml: &str) {
        self.writer.write_all(xml.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub(crate) async fn next_event(&mut self) -> Option<StreamEvent> {
        tokio::time::timeout(WAIT, self.reader.next_event())
            .await
            .expect("timed out waiting for client output")
            .unwrap()
    }

    pub(crate) async fn expect_header(&mut self) -> StreamHeader {
        match self.next_event().await {
            Some(StreamEvent::Open(header)) => header,
            other => panic!("expected stream header, got {:?}", other),
        }
    }

    pub(crate) async fn expect_element(&mut self) -> Element {
        match self.next_event().await {
            Some(StreamEvent::Element(el)) => el,
            other => panic!("expected element, got {:?}", other),
        }
    }

    /// Nothing arrives from the client for `ms` milliseconds.
    pub(crate) async fn expect_silence(&mut self, ms: u64) {
        let result = tokio::time::timeout(Duration::from_millis(ms), self.reader.next_event()).await;
        assert!(result.is_err(), "unexpected client output: {:?}", result);
    }

    /// Remaining client output up to EOF.
    pub(crate) async fn drain(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

/// Client transport plus the server end of an in-memory socket.
pub(crate) fn socket_pair() -> (BoxedTransport, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(server);
    (
        Box::new(client),
        FakeServer {
            reader: StanzaReader::new(read),
            writer: write,
        },
    )
}

pub(crate) async fn attached_stream() -> (StreamContext, FakeServer) {
    let (transport, server) = socket_pair();
    let mut stream = StreamContext::new();
    stream.attach(transport).await;
    (stream, server)
}
