//! Client-side XMPP stream engine.
//!
//! A [`ConnectionHandler`] owns one XML stream: it negotiates the stream
//! through pluggable [`StreamProcessor`]s, runs the single read loop that
//! classifies inbound stanzas, and correlates replies with requests queued
//! through its [`PacketQueue`]. The [`connector`] module opens sockets and
//! wires the pieces together.

pub mod config;
pub mod connector;
pub mod context;
pub mod error;
pub mod framing;
pub mod handler;
pub mod id;
pub mod listener;
pub mod processor;
pub mod queue;
pub mod stanza;
pub mod xml;

#[cfg(test)]
mod testing;

pub use config::ConnectionInfo;
pub use context::{BoxedTransport, SessionContext, StreamContext, StreamFeatures, Transport};
pub use error::{Error, Result};
pub use handler::{ConnectionHandler, RunningState};
pub use id::{IdGenerator, SequentialIds};
pub use listener::PacketListener;
pub use processor::{
    HandshakeStream, ResourceBindingStream, SaslPlainStream, StartTlsStream, StreamProcessor, StreamProcessors,
};
pub use queue::{PacketQueue, PacketSink, QueueState};
pub use stanza::{Packet, PacketKind};
