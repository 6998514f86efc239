//! Connection handler: the stream state machine and its single read loop.
//!
//! ```text
//! Stopped --handshake()--> Handshaking --> Running <--pause()/resume()--> Paused
//!    ^                                                                      |
//!    +------------------------------ shutdown() ----------------------------+
//! ```
//!
//! The read loop owns the read side of the wire. Anything else that needs the
//! wire (resource binding, authentication, ...) goes through
//! [`ConnectionHandler::process_stream`], which pauses the loop for the
//! duration of the processor. Outbound packets go through the
//! [`PacketQueue`], whose single sender task writes under the writer lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionInfo;
use crate::context::{BoxedTransport, SessionContext, SharedWriter, StreamContext};
use crate::error::{Error, Result};
use crate::framing::StreamEvent;
use crate::id::IdGenerator;
use crate::listener::{ListenerManager, PacketListener};
use crate::processor::{StreamProcessor, StreamProcessors};
use crate::queue::{PacketQueue, PacketSink};
use crate::stanza::{condition, ErrorType, Iq, IqKind, Message, Packet, Presence, StreamError};
use crate::xml::{ns, Element};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Handshaking,
    Running,
    Paused,
    Stopped,
}

/// Monotonic connection id for correlating logs across tasks.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub struct ConnectionHandler {
    conn_id: u64,
    this: Weak<ConnectionHandler>,
    state: watch::Sender<RunningState>,
    /// Serializes state transitions with `start` and `shutdown`.
    lifecycle: parking_lot::Mutex<()>,
    session: Mutex<SessionContext>,
    stream: Mutex<StreamContext>,
    writer: SharedWriter,
    queue: Arc<PacketQueue>,
    processors: StreamProcessors,
    ids: Arc<dyn IdGenerator>,
    listeners: ListenerManager,
}

/// Resumes the handler when dropped, so a failing processor never leaves it paused.
struct PauseGuard<'a> {
    handler: &'a ConnectionHandler,
}

impl<'a> PauseGuard<'a> {
    /// `None` unless this call moved the handler from Running to Paused.
    fn acquire(handler: &'a ConnectionHandler) -> Option<Self> {
        handler.pause().then_some(Self { handler })
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.handler.resume();
    }
}

impl ConnectionHandler {
    pub fn new(processors: StreamProcessors, ids: Arc<dyn IdGenerator>) -> Arc<Self> {
        let (state, state_rx) = watch::channel(RunningState::Stopped);
        let mut stream = StreamContext::new();
        stream.watch_state(state_rx);
        let writer = stream.writer_handle();

        Arc::new_cyclic(|this| ConnectionHandler {
            conn_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            this: this.clone(),
            state,
            lifecycle: parking_lot::Mutex::new(()),
            session: Mutex::new(SessionContext::default()),
            stream: Mutex::new(stream),
            writer,
            queue: Arc::new(PacketQueue::new()),
            processors,
            ids,
            listeners: ListenerManager::default(),
        })
    }

    pub fn state(&self) -> RunningState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == RunningState::Running
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners.remove(listener);
    }

    /// Copy of the negotiated session.
    pub async fn session(&self) -> SessionContext {
        self.session.lock().await.clone()
    }

    /// Number of callers waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.queue.pending_replies()
    }

    /// Reset for a new connection attempt.
    ///
    /// Leaves the handler Stopped and the outbound queue started but paused:
    /// packets queued from now on are held until negotiation completes.
    pub async fn start(&self) {
        self.session.lock().await.reset();
        self.stream.lock().await.reset().await;

        let _lifecycle = self.lifecycle.lock();
        self.state.send_replace(RunningState::Stopped);
        let sink: Weak<dyn PacketSink> = self.this.clone();
        self.queue.start(true, sink);
        debug!(conn_id = self.conn_id, "Connection handler started");
    }

    /// Negotiate the stream over `transport`: handshake, then STARTTLS and a
    /// second handshake when offered and a TLS processor is configured.
    ///
    /// On success the handler is Running and queued packets start flowing.
    /// Any failure is reported as [`Error::HandshakeFailed`] and the handler
    /// does not become connected.
    pub async fn handshake(&self, transport: BoxedTransport, info: &ConnectionInfo) -> Result<()> {
        {
            let _lifecycle = self.lifecycle.lock();
            self.state.send_replace(RunningState::Handshaking);
        }
        info!(conn_id = self.conn_id, domain = %info.domain, "Handshaking");

        if let Err(e) = self.negotiate(transport, info).await {
            error!(conn_id = self.conn_id, error = %e, "Handshake failed");
            return Err(match e {
                Error::HandshakeFailed(_) => e,
                other => Error::HandshakeFailed(Box::new(other)),
            });
        }

        let _lifecycle = self.lifecycle.lock();
        let promoted = self.state.send_if_modified(|s| {
            if *s == RunningState::Handshaking {
                *s = RunningState::Running;
                true
            } else {
                false
            }
        });
        if !promoted {
            return Err(Error::HandshakeFailed(Box::new(Error::protocol(
                "connection shut down during handshake",
            ))));
        }
        self.queue.resume();
        info!(conn_id = self.conn_id, "Stream negotiated");
        Ok(())
    }

    async fn negotiate(&self, transport: BoxedTransport, info: &ConnectionInfo) -> Result<()> {
        let mut session = self.session.lock().await;
        let mut stream = self.stream.lock().await;

        session.host_name = info.domain.clone();
        session.username = info.username.clone();
        session.password = info.password.clone();
        session.resource = info.resource.clone();
        stream.attach(transport).await;

        self.processors.handshake.process(&mut session, &mut stream).await?;
        if !stream.features.starttls {
            return Ok(());
        }
        match &self.processors.tls {
            Some(tls) => {
                tls.process(&mut session, &mut stream).await?;
                self.processors.handshake.process(&mut session, &mut stream).await
            }
            None if stream.features.starttls_required => Err(Error::Tls(
                "server requires STARTTLS but no TLS processor is configured".to_string(),
            )),
            None => {
                warn!(conn_id = self.conn_id, "Server offers STARTTLS, continuing unencrypted");
                Ok(())
            }
        }
    }

    /// Run the read loop until the stream ends, fails or the handler shuts down.
    ///
    /// Always finishes with shutdown, the stream end tag and transport close.
    /// Read errors are logged, not returned.
    pub async fn handle(&self) {
        let mut state_rx = self.state.subscribe();
        match self.read_loop(&mut state_rx).await {
            Ok(()) => info!(conn_id = self.conn_id, "Stream ended"),
            Err(e) => warn!(conn_id = self.conn_id, error = %e, "Read loop terminated"),
        }

        self.shutdown();
        self.stream.lock().await.close().await;
        debug!(conn_id = self.conn_id, "Connection closed");
    }

    async fn read_loop(&self, state_rx: &mut watch::Receiver<RunningState>) -> Result<()> {
        loop {
            // Paused or still negotiating: wait without touching the wire.
            let current = match state_rx
                .wait_for(|s| matches!(s, RunningState::Running | RunningState::Stopped))
                .await
            {
                Ok(state) => *state,
                Err(_) => return Ok(()),
            };
            if current == RunningState::Stopped {
                return Ok(());
            }

            let event = {
                let mut stream = self.stream.lock().await;
                let read = tokio::select! {
                    biased;
                    _ = state_rx.wait_for(|s| *s != RunningState::Running) => None,
                    read = stream.read_event() => Some(read),
                };
                let Some(read) = read else {
                    continue;
                };

                match self.state() {
                    RunningState::Running => {}
                    RunningState::Paused => {
                        // Completed as the pause landed: hand it to whoever paused us.
                        if let Ok(Some(event)) = read {
                            stream.push_back(event);
                        }
                        continue;
                    }
                    _ => return Ok(()),
                }
                read?
            };

            match event {
                None | Some(StreamEvent::Close) => return Ok(()),
                Some(StreamEvent::Open(header)) => {
                    warn!(conn_id = self.conn_id, stream_id = ?header.id, "Unexpected stream restart, ignoring");
                }
                Some(StreamEvent::Element(element)) => self.dispatch(element).await?,
            }
        }
    }

    /// Classify one top-level element. Only a stream error is fatal.
    async fn dispatch(&self, element: Element) -> Result<()> {
        match (element.ns(), element.name()) {
            (ns::CLIENT, "message") => match Message::from_element(&element) {
                Ok(message) if message.is_empty() => {
                    debug!(conn_id = self.conn_id, from = ?message.attrs.from, "Discarding empty message");
                }
                Ok(message) => self.deliver(Packet::Message(message)),
                Err(e) => warn!(conn_id = self.conn_id, error = %e, "Dropping malformed message"),
            },
            (ns::CLIENT, "presence") => match Presence::from_element(&element) {
                Ok(presence) => self.deliver(Packet::Presence(presence)),
                Err(e) => warn!(conn_id = self.conn_id, error = %e, "Dropping malformed presence"),
            },
            (ns::CLIENT, "iq") => match Iq::from_element(&element) {
                Ok(iq) if iq.kind() == IqKind::Generic && iq.iq_type.is_request() => {
                    self.reject_request(&iq).await;
                }
                Ok(iq) => self.deliver(Packet::Iq(iq)),
                Err(e) => warn!(conn_id = self.conn_id, error = %e, "Dropping malformed iq"),
            },
            (ns::STREAM, "error") => {
                let stream_error = StreamError::from_element(&element);
                error!(conn_id = self.conn_id, condition = %stream_error.condition, text = ?stream_error.text, "Received stream error");
                return Err(Error::Stream(stream_error));
            }
            (namespace, name) => {
                debug!(conn_id = self.conn_id, ns = namespace, name, "Ignoring unknown element");
            }
        }
        Ok(())
    }

    fn deliver(&self, packet: Packet) {
        let packet = self.queue.packet_received(packet);
        self.listeners.dispatch(&packet);
    }

    /// Answer an IQ request nobody handles with `service-unavailable`.
    async fn reject_request(&self, iq: &Iq) {
        debug!(conn_id = self.conn_id, id = ?iq.attrs.id, from = ?iq.attrs.from, "Rejecting unhandled iq request");
        // TODO: include the original payload in the error reply (RFC 6120 section 8.3.1)
        let reply = iq.error_reply(condition::SERVICE_UNAVAILABLE, ErrorType::Cancel);
        if let Err(e) = self.queue.queue_packet(Packet::Iq(reply), false).await {
            warn!(conn_id = self.conn_id, error = %e, "Failed to queue error reply");
        }
    }

    /// Queue `packet` for sending, assigning an id when it has none.
    ///
    /// With `wait`, resolves to the reply carrying the same id, re-wrapped
    /// into the kind of `packet`. There is no timeout: the wait ends with a
    /// reply, a send failure or shutdown.
    pub async fn queue_packet(&self, mut packet: Packet, wait: bool) -> Result<Option<Packet>> {
        if packet.id().is_none() && !matches!(packet, Packet::Raw(_)) {
            match self.ids.next_id() {
                Ok(id) => packet.set_id(id),
                Err(e) => warn!(conn_id = self.conn_id, error = %e, "Id generation failed, sending without id"),
            }
        }
        self.queue.queue_packet(packet, wait).await
    }

    /// Write one packet to the wire, bypassing the queue.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| Error::SendFailed("not connected".to_string()))?;
        writer.write_packet(packet).await.map_err(|e| {
            warn!(conn_id = self.conn_id, error = %e, id = ?packet.id(), "Send failed");
            Error::SendFailed(e.to_string())
        })
    }

    /// Give `processor` exclusive use of the wire while the handler is Running.
    ///
    /// The read loop and the sender are paused for the duration and resumed
    /// afterwards even when the processor fails. With `redo_handshake` the
    /// stream is restarted once the processor succeeds.
    pub async fn process_stream(&self, processor: &dyn StreamProcessor, redo_handshake: bool) -> Result<()> {
        let Some(_pause) = PauseGuard::acquire(self) else {
            return Err(Error::protocol("connection is not running"));
        };

        let mut session = self.session.lock().await;
        let mut stream = self.stream.lock().await;
        processor.process(&mut session, &mut stream).await?;
        if redo_handshake {
            self.processors.handshake.process(&mut session, &mut stream).await?;
        }
        Ok(())
    }

    /// Running to Paused. Returns whether this call changed the state.
    pub fn pause(&self) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let paused = self.state.send_if_modified(|s| {
            if *s == RunningState::Running {
                *s = RunningState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            self.queue.pause();
            debug!(conn_id = self.conn_id, "Paused");
        }
        paused
    }

    pub fn resume(&self) {
        let _lifecycle = self.lifecycle.lock();
        let resumed = self.state.send_if_modified(|s| {
            if *s == RunningState::Paused {
                *s = RunningState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            self.queue.resume();
            debug!(conn_id = self.conn_id, "Resumed");
        }
    }

    /// Stop the handler: wakes the read loop and any processor blocked on a
    /// read, and fails every queued packet and waiter. Idempotent.
    ///
    /// The transport itself is closed when [`handle`](Self::handle) returns.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        let mut previous = RunningState::Stopped;
        self.state.send_if_modified(|s| {
            previous = *s;
            *s = RunningState::Stopped;
            previous != RunningState::Stopped
        });
        self.queue.stop();
        if previous != RunningState::Stopped {
            info!(conn_id = self.conn_id, previous = ?previous, "Connection handler shut down");
        }
    }
}

#[async_trait]
impl PacketSink for ConnectionHandler {
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        ConnectionHandler::send_packet(self, packet).await
    }
}
