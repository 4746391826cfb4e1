use bytes::Bytes;
use tracing::trace;

use crate::datagram_layer::DatagramLayer;
use crate::end_point::EndPoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub from: EndPoint,
    pub to: EndPoint,
    pub packet: Bytes,
}

/// Collects the side effects of protocol processing: packets to send and application callbacks
///  to invoke. Protocol state is updated under locks, and the collected effects are executed
///  after all locks are released.
#[derive(Default)]
pub struct Outbox {
    packets: Vec<OutgoingPacket>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Outbox {
    pub fn new() -> Outbox {
        Outbox::default()
    }

    pub fn send(&mut self, from: EndPoint, to: EndPoint, packet: Bytes) {
        self.packets.push(OutgoingPacket { from, to, packet });
    }

    pub fn defer(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn append(&mut self, mut other: Outbox) {
        self.packets.append(&mut other.packets);
        self.callbacks.append(&mut other.callbacks);
    }

    pub fn packets(&self) -> &[OutgoingPacket] {
        &self.packets
    }

    pub fn num_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.callbacks.is_empty()
    }

    /// sends all packets, then invokes all callbacks, each in the order they were added
    pub async fn flush(self, datagram_layer: &dyn DatagramLayer) {
        trace!("flushing {} packets and {} callbacks", self.packets.len(), self.callbacks.len());
        for p in self.packets {
            datagram_layer.send(p.from, p.to, p.packet).await;
        }
        for callback in self.callbacks {
            callback();
        }
    }

    /// Invokes the callbacks, discarding the packets. This is for code paths that must not
    ///  send anything.
    pub fn run_callbacks(self) {
        for callback in self.callbacks {
            callback();
        }
    }
}
