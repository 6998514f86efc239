//! XMPP stream framing: stanza boundary extraction, the incoming stanza
//! reader and the outgoing stanza writer.
//!
//! Boundary detection is stateless over a byte buffer: the reader keeps
//! appending socket data and cuts complete top-level elements off the front.
//! This keeps [`StanzaReader::next_event`] cancel-safe, which the connection
//! handler relies on to abandon a pending read when it is paused or stopped.

use std::collections::VecDeque;

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::stanza::Packet;
use crate::xml::{self, ns, Element, NamespaceScope};

/// Maximum allowed size for the incoming stanza buffer.
///
/// Typical stanzas are a few KB; the largest legitimate ones (vCard avatars,
/// MAM result pages) rarely exceed 100 KB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

const STREAM_CLOSE: &str = "</stream:stream>";

/// A top-level unit cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` including any leading XML declaration.
    StreamOpen(String),
    StreamClose,
    Stanza(String),
}

/// State machine for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Waiting for a stanza to start (between stanzas, or before stream open).
    Idle,
    /// Inside a top-level stanza, collecting events.
    InStanza,
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_name(full: &[u8], local: &[u8]) -> bool {
    local == b"stream" || full == b"stream:stream"
}

/// Extract a single complete frame from the front of `buffer`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` when a frame is complete,
/// `Ok(None)` when more data is needed and `Err` when the data can never
/// become well-formed.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>> {
    // The closing tag appears alone, without its opening tag in the buffer.
    let trimmed = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(start) = trimmed {
        if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Ok(Some((Frame::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[..tag_end])), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[..tag_end])), tag_end)));
                }

                // Self-closing top-level stanza (e.g. <presence/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Stanza(bytes_to_string(&buffer[pos..tag_end])), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, tag_end)));
                }

                depth = depth.saturating_sub(1);

                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Stanza(bytes_to_string(&buffer[stanza_start..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Partial stanza, completed by the next read.
                return Ok(None);
            }
            Err(e) => {
                error!(error = ?e, "XML parsing error");
                return Err(e.into());
            }
        }
    }
}

/// Attributes of the remote `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub scope: NamespaceScope,
}

impl StreamHeader {
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    let mut header = StreamHeader {
                        scope: NamespaceScope::client_stream(),
                        ..Default::default()
                    };
                    for attr in e.attributes() {
                        let attr = attr?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr.unescape_value()?.into_owned();
                        if header.scope.declare(&key, &value) {
                            continue;
                        }
                        match key.as_str() {
                            "id" => header.id = Some(value),
                            "from" => header.from = Some(value),
                            "to" => header.to = Some(value),
                            "version" => header.version = Some(value),
                            "xml:lang" => header.lang = Some(value),
                            _ => {}
                        }
                    }
                    return Ok(header);
                }
                Event::Eof => return Err(Error::protocol("missing stream header")),
                _ => {}
            }
        }
    }
}

/// One event read off the incoming stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Open(StreamHeader),
    Element(Element),
    Close,
}

/// Incremental, cancel-safe reader of top-level stream events.
pub struct StanzaReader<R> {
    inner: R,
    buffer: Vec<u8>,
    scope: NamespaceScope,
    pushed_back: VecDeque<StreamEvent>,
}

impl<R: AsyncRead + Unpin> StanzaReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            scope: NamespaceScope::client_stream(),
            pushed_back: VecDeque::new(),
        }
    }

    /// Next top-level event, or `None` at end of input.
    ///
    /// Dropping the returned future before completion loses no data.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        if let Some(event) = self.pushed_back.pop_front() {
            return Ok(Some(event));
        }

        let mut read_buf = [0u8; 8192];
        loop {
            if let Some(event) = self.take_buffered()? {
                return Ok(Some(event));
            }

            // Guard against unbounded buffer growth from incomplete/malformed XML
            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                error!(
                    buffer_bytes = self.buffer.len(),
                    limit = MAX_STANZA_BUFFER_SIZE,
                    "Stanza buffer exceeded size limit"
                );
                return Err(Error::protocol("stanza exceeds maximum size"));
            }

            let n = self.inner.read(&mut read_buf).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    debug!(bytes = self.buffer.len(), "Input ended inside a stanza");
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&read_buf[..n]);
            debug!(bytes = n, "Received data");
        }
    }

    /// Next child element; stream restarts and the stream end are protocol errors.
    pub async fn next_element(&mut self) -> Result<Element> {
        match self.next_event().await? {
            Some(StreamEvent::Element(e)) => Ok(e),
            Some(StreamEvent::Open(_)) => Err(Error::protocol("unexpected stream header")),
            Some(StreamEvent::Close) | None => Err(Error::protocol("stream closed by remote")),
        }
    }

    /// Return an event to the front of the reader.
    pub fn push_back(&mut self, event: StreamEvent) {
        self.pushed_back.push_front(event);
    }

    /// Whether bytes or events are waiting that the transport no longer has.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty() || !self.pushed_back.is_empty()
    }

    pub fn into_inner(self) -> R {
        if self.has_buffered_data() {
            warn!(bytes = self.buffer.len(), "Discarding buffered input on transport release");
        }
        self.inner
    }

    fn take_buffered(&mut self) -> Result<Option<StreamEvent>> {
        // Whitespace keepalives between stanzas
        let start = self
            .buffer
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        if start > 0 {
            self.buffer.drain(..start);
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some((frame, consumed)) = extract_frame(&self.buffer)? else {
            return Ok(None);
        };
        self.buffer.drain(..consumed);

        let event = match frame {
            Frame::StreamOpen(text) => {
                debug!(data = %text, "RECV");
                let header = StreamHeader::parse(&text)?;
                self.scope = header.scope.clone();
                StreamEvent::Open(header)
            }
            Frame::StreamClose => {
                debug!("RECV stream close");
                StreamEvent::Close
            }
            Frame::Stanza(text) => {
                debug!(data = %text, "RECV");
                StreamEvent::Element(xml::parse(&text, &self.scope)?)
            }
        };
        Ok(Some(event))
    }
}

/// Build the client `<stream:stream>` opening tag.
pub fn stream_open_tag(to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        quick_xml::escape::escape(to)
    )
}

/// Serializes outgoing markup; every write is flushed.
pub struct StanzaWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StanzaWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_raw(&mut self, markup: &str) -> Result<()> {
        debug!(data = %markup, "SEND");
        self.inner.write_all(markup.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_element(&mut self, element: &Element) -> Result<()> {
        self.write_raw(&element.to_xml(ns::CLIENT)).await
    }

    /// Serialize one packet. IQs marshal their typed payload, raw packets
    /// pass through untouched, everything else takes the generic path.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        match packet {
            Packet::Iq(iq) => self.write_element(&iq.to_element()).await,
            Packet::Raw(text) => self.write_raw(text).await,
            Packet::Message(m) => self.write_element(&m.to_element()).await,
            Packet::Presence(p) => self.write_element(&p.to_element()).await,
        }
    }

    pub async fn open_stream(&mut self, to: &str) -> Result<()> {
        self.write_raw(&stream_open_tag(to)).await
    }

    pub async fn close_stream(&mut self) -> Result<()> {
        self.write_raw(STREAM_CLOSE).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(buf: &[u8]) -> (String, usize) {
        match extract_frame(buf).unwrap() {
            Some((Frame::Stanza(s), n)) => (s, n),
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        match extract_frame(buf).unwrap() {
            Some((Frame::StreamOpen(text), consumed)) => {
                assert!(text.contains("<stream:stream"));
                assert_eq!(consumed, buf.len());
            }
            other => panic!("expected stream open, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (text, consumed) = stanza(buf);
        assert!(text.starts_with("<stream:features"));
        assert!(text.ends_with("</stream:features>"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_multiple_stanzas() {
        let buf = b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>";
        let (first, n1) = stanza(buf);
        assert!(first.starts_with("<presence"));
        let (second, n2) = stanza(&buf[n1..]);
        assert!(second.contains("Hello"));
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn test_extract_incomplete_stanza() {
        let buf = b"<iq type='get'><query xmlns='jabber:iq:roster'>";
        assert!(extract_frame(buf).unwrap().is_none());
    }

    #[test]
    fn test_extract_partial_tag() {
        assert!(extract_frame(b"<message to='a@b").unwrap().is_none());
    }

    #[test]
    fn test_extract_stream_closing_with_leading_whitespace() {
        let buf = b"  \n</stream:stream>";
        assert_eq!(
            extract_frame(buf).unwrap(),
            Some((Frame::StreamClose, buf.len()))
        );
    }

    #[test]
    fn test_stream_header_parse() {
        let header = StreamHeader::parse(
            "<?xml version='1.0'?><stream:stream from='example.com' id='abc' version='1.0' xml:lang='en' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .unwrap();
        assert_eq!(header.id.as_deref(), Some("abc"));
        assert_eq!(header.from.as_deref(), Some("example.com"));
        assert_eq!(header.version.as_deref(), Some("1.0"));
        assert_eq!(header.lang.as_deref(), Some("en"));
        assert_eq!(header.scope.default_ns(), Some(ns::CLIENT));
    }

    #[tokio::test]
    async fn test_reader_reassembles_fragmented_input() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = StanzaReader::new(client);

        tokio::spawn(async move {
            for chunk in [
                "<?xml version='1.0'?><stream:stream xmlns='jabber:client' ",
                "xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>",
                " \n<message from='a@b'><bo",
                "dy>hi</body></message></stream:stream>",
            ] {
                server.write_all(chunk.as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        match reader.next_event().await.unwrap() {
            Some(StreamEvent::Open(h)) => assert_eq!(h.id.as_deref(), Some("s1")),
            other => panic!("expected open, got {:?}", other),
        }
        let msg = reader.next_element().await.unwrap();
        assert!(msg.is("message", ns::CLIENT));
        assert_eq!(msg.get_child("body", ns::CLIENT).unwrap().text(), "hi");
        assert_eq!(reader.next_event().await.unwrap(), Some(StreamEvent::Close));
        assert_eq!(reader.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_push_back_is_returned_first() {
        let (_server, client) = tokio::io::duplex(64);
        let mut reader = StanzaReader::new(client);
        reader.push_back(StreamEvent::Close);
        assert_eq!(reader.next_event().await.unwrap(), Some(StreamEvent::Close));
    }

    #[tokio::test]
    async fn test_reader_rejects_malformed_xml() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = StanzaReader::new(client);
        server.write_all(b"<message></presence>").await.unwrap();
        drop(server);
        assert!(reader.next_event().await.is_err());
    }

    #[tokio::test]
    async fn test_writer_flushes_packets() {
        let (server, client) = tokio::io::duplex(256);
        let mut writer = StanzaWriter::new(client);
        writer.write_raw("<presence/>").await.unwrap();
        writer.close_stream().await.unwrap();
        drop(writer);

        let mut out = String::new();
        let mut server = server;
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "<presence/></stream:stream>");
    }
}
