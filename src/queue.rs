//! Outbound packet queue with request/reply correlation.
//!
//! Callers enqueue packets from any task; a single sender task drains the
//! queue in FIFO order and hands each packet to a [`PacketSink`]. A caller
//! that asks to wait gets the inbound packet carrying the same id, re-wrapped
//! into the kind of the request it sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::stanza::{Packet, PacketKind};

/// How long `stop` lets an in-flight write finish before aborting the sender.
pub const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Running,
    Paused,
}

/// Physical writer the sender task hands packets to.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, packet: &Packet) -> Result<()>;
}

struct Outbound {
    packet: Packet,
    /// Reply-table key when a caller is waiting on this packet.
    awaited: Option<String>,
}

struct Waiter {
    kind: PacketKind,
    tx: oneshot::Sender<Result<Packet>>,
}

/// A caller's claim on a reply-table entry. Dropping it before the reply
/// arrives removes the entry.
struct PendingReply<'a> {
    queue: &'a PacketQueue,
    id: String,
    rx: oneshot::Receiver<Result<Packet>>,
}

impl PendingReply<'_> {
    async fn wait(mut self) -> Result<Option<Packet>> {
        match (&mut self.rx).await {
            Ok(reply) => reply.map(Some),
            Err(_) => Err(Error::QueueStopped),
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.rx.close();
        let mut replies = self.queue.replies.lock();
        // Only our own entry: a closed sender means nobody else reused the id
        if replies.get(&self.id).is_some_and(|w| w.tx.is_closed()) {
            replies.remove(&self.id);
            debug!(id = %self.id, "Reply wait abandoned");
        }
    }
}

pub struct PacketQueue {
    state: watch::Sender<QueueState>,
    /// Lock order: `replies` before `outbound`.
    replies: Mutex<HashMap<String, Waiter>>,
    outbound: Mutex<VecDeque<Outbound>>,
    wakeup: Notify,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        let (state, _) = watch::channel(QueueState::Stopped);
        Self {
            state,
            replies: Mutex::new(HashMap::new()),
            outbound: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            sender: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Clear both structures and launch a fresh sender task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, paused: bool, sink: Weak<dyn PacketSink>) {
        if let Some(previous) = self.sender.lock().take() {
            previous.abort();
        }
        self.release_all();

        let initial = if paused {
            QueueState::Paused
        } else {
            QueueState::Running
        };
        self.state.send_replace(initial);

        let handle = tokio::spawn(Arc::clone(self).run_sender(sink));
        *self.sender.lock() = Some(handle);
        debug!(paused, "Packet queue started");
    }

    /// Enqueue `packet`. With `wait`, resolve to the correlated reply.
    ///
    /// Waiting requires the packet to carry an id. Fails with
    /// [`Error::QueueStopped`] if the queue is, or becomes, stopped first.
    pub async fn queue_packet(&self, packet: Packet, wait: bool) -> Result<Option<Packet>> {
        let receiver = {
            let mut replies = self.replies.lock();
            if self.state() == QueueState::Stopped {
                return Err(Error::QueueStopped);
            }

            let (awaited, receiver) = if wait {
                let id = packet
                    .id()
                    .ok_or_else(|| Error::SendFailed("cannot wait for a reply to a packet without id".to_string()))?
                    .to_string();
                let (tx, rx) = oneshot::channel();
                replies.insert(
                    id.clone(),
                    Waiter {
                        kind: packet.kind(),
                        tx,
                    },
                );
                (Some(id.clone()), Some(PendingReply { queue: self, id, rx }))
            } else {
                (None, None)
            };

            self.outbound.lock().push_back(Outbound { packet, awaited });
            receiver
        };
        self.wakeup.notify_one();

        match receiver {
            None => Ok(None),
            Some(pending) => pending.wait().await,
        }
    }

    /// Match an inbound packet against outstanding requests.
    ///
    /// Returns the packet to hand to listeners: the recast reply when a waiter
    /// matched, the packet unchanged otherwise.
    pub fn packet_received(&self, packet: Packet) -> Packet {
        let waiter = match packet.id() {
            Some(id) => self.replies.lock().remove(id),
            None => None,
        };
        let Some(waiter) = waiter else {
            return packet;
        };

        let reply = packet.recast(waiter.kind);
        if waiter.tx.send(Ok(reply.clone())).is_err() {
            debug!(id = ?reply.id(), "Reply arrived after its waiter went away");
        }
        reply
    }

    pub fn pause(&self) {
        self.state.send_if_modified(|s| {
            if *s == QueueState::Running {
                *s = QueueState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.state.send_if_modified(|s| {
            if *s == QueueState::Paused {
                *s = QueueState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Terminal: drop queued packets and fail every waiter.
    ///
    /// A write already in progress may finish; the sender exits after it, or
    /// is aborted once [`SENDER_DRAIN_TIMEOUT`] has passed.
    pub fn stop(&self) {
        let previous = self.state.send_replace(QueueState::Stopped);
        let released = self.release_all();
        if let Some(sender) = self.sender.lock().take() {
            Self::drain_sender(sender);
        }
        if previous != QueueState::Stopped {
            debug!(released, "Packet queue stopped");
        }
    }

    fn drain_sender(mut sender: JoinHandle<()>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            sender.abort();
            return;
        };
        runtime.spawn(async move {
            if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender).await.is_err() {
                warn!("Packet sender still writing after stop, aborting");
                sender.abort();
            }
        });
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    fn release_all(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut replies = self.replies.lock();
            self.outbound.lock().clear();
            replies.drain().map(|(_, w)| w).collect()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::QueueStopped));
        }
        count
    }

    async fn run_sender(self: Arc<Self>, sink: Weak<dyn PacketSink>) {
        let mut state = self.state.subscribe();
        loop {
            let current = match state.wait_for(|s| *s != QueueState::Paused).await {
                Ok(s) => *s,
                Err(_) => break,
            };
            if current == QueueState::Stopped {
                break;
            }

            let next = self.outbound.lock().pop_front();
            let Some(entry) = next else {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = state.changed() => {}
                }
                continue;
            };

            let Some(target) = sink.upgrade() else {
                self.fail_entry(entry, Error::SendFailed("connection handler dropped".to_string()));
                break;
            };
            if let Err(e) = target.send_packet(&entry.packet).await {
                self.fail_entry(entry, e);
            }
        }
        debug!("Packet sender exited");
    }

    fn fail_entry(&self, entry: Outbound, error: Error) {
        match entry.awaited {
            Some(id) => {
                let waiter = self.replies.lock().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.tx.send(Err(error));
                }
            }
            None => warn!(error = %error, id = ?entry.packet.id(), "Dropping packet after send failure"),
        }
    }
}
