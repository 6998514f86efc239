use std::sync::Arc;

use parking_lot::RwLock;

use crate::stanza::Packet;

/// Receives every inbound stanza that survives filtering and reply correlation.
pub trait PacketListener: Send + Sync {
    fn on_packet_received(&self, packet: &Packet);
}

impl<F> PacketListener for F
where
    F: Fn(&Packet) + Send + Sync,
{
    fn on_packet_received(&self, packet: &Packet) {
        self(packet)
    }
}

#[derive(Default)]
pub struct ListenerManager {
    listeners: RwLock<Vec<Arc<dyn PacketListener>>>,
}

impl ListenerManager {
    pub fn add(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn dispatch(&self, packet: &Packet) {
        // Snapshot so a listener may register or remove listeners.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_packet_received(packet);
        }
    }
}
