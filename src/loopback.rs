use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::datagram_layer::{DatagramLayer, DatagramRecipient};
use crate::end_point::EndPoint;
use crate::util::lock;

/// What happens to a packet handed to a [LoopbackNetwork]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fate {
    Deliver,
    Drop,
    /// delivered twice
    Duplicate,
    /// delivered after all packets that are in transit at the time
    Delay,
}

/// Decides the fate of each packet: called with a running packet number (starting at 0) and
///  the packet's source, destination and payload
pub type FaultInjector = Box<dyn FnMut(u64, &EndPoint, &EndPoint, &[u8]) -> Fate + Send>;

struct InTransit {
    from: EndPoint,
    to: EndPoint,
    packet: Bytes,
}

#[derive(Default)]
struct LoopbackState {
    recipients: BTreeMap<EndPoint, Arc<dyn DatagramRecipient>>,
    in_transit: VecDeque<InTransit>,
    delayed: VecDeque<InTransit>,
    fault_injector: Option<FaultInjector>,

    num_sent: u64,
    num_dropped: u64,
    num_delivered: u64,
}

/// An in-process datagram layer. Sent packets are buffered until [LoopbackNetwork::deliver_all]
///  is called, which makes delivery deterministic and lets a fault injector drop, duplicate or
///  reorder packets.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<LoopbackState>,
}

impl LoopbackNetwork {
    pub fn new() -> LoopbackNetwork {
        LoopbackNetwork::default()
    }

    pub fn with_fault_injector(fault_injector: impl FnMut(u64, &EndPoint, &EndPoint, &[u8]) -> Fate + Send + 'static) -> LoopbackNetwork {
        let network = LoopbackNetwork::new();
        network.set_fault_injector(Some(Box::new(fault_injector)));
        network
    }

    pub fn set_fault_injector(&self, fault_injector: Option<FaultInjector>) {
        lock(&self.state).fault_injector = fault_injector;
    }

    pub fn num_sent(&self) -> u64 {
        lock(&self.state).num_sent
    }

    pub fn num_dropped(&self) -> u64 {
        lock(&self.state).num_dropped
    }

    pub fn num_delivered(&self) -> u64 {
        lock(&self.state).num_delivered
    }

    pub fn num_in_transit(&self) -> usize {
        let state = lock(&self.state);
        state.in_transit.len() + state.delayed.len()
    }

    /// Delivers packets until there are none left in transit, including packets sent while
    ///  handling the delivered ones. Delayed packets are delivered when nothing else is in
    ///  transit. Returns the number of packets delivered.
    pub async fn deliver_all(&self) -> usize {
        let mut num_delivered = 0;
        loop {
            let batch = {
                let mut state = lock(&self.state);
                if state.in_transit.is_empty() {
                    std::mem::take(&mut state.delayed)
                }
                else {
                    std::mem::take(&mut state.in_transit)
                }
            };
            if batch.is_empty() {
                return num_delivered;
            }

            for p in batch {
                let recipient = lock(&self.state).recipients.get(&p.to).cloned();
                match recipient {
                    Some(recipient) => {
                        lock(&self.state).num_delivered += 1;
                        recipient.on_datagram(p.from, p.to, p.packet).await;
                        num_delivered += 1;
                    }
                    None => trace!("no recipient at {:?} - dropping packet", p.to),
                }
            }
        }
    }
}

#[async_trait]
impl DatagramLayer for LoopbackNetwork {
    async fn send(&self, from: EndPoint, to: EndPoint, packet: Bytes) {
        let mut state = lock(&self.state);
        let packet_number = state.num_sent;
        state.num_sent += 1;

        let fate = match state.fault_injector.as_mut() {
            Some(fault_injector) => fault_injector(packet_number, &from, &to, &packet),
            None => Fate::Deliver,
        };
        trace!("packet #{} from {:?} to {:?}: {:?}", packet_number, from, to, fate);

        match fate {
            Fate::Deliver => state.in_transit.push_back(InTransit { from, to, packet }),
            Fate::Drop => state.num_dropped += 1,
            Fate::Duplicate => {
                state.in_transit.push_back(InTransit { from, to, packet: packet.clone() });
                state.in_transit.push_back(InTransit { from, to, packet });
            }
            Fate::Delay => state.delayed.push_back(InTransit { from, to, packet }),
        }
    }

    fn register_recipient(&self, end_point: EndPoint, recipient: Arc<dyn DatagramRecipient>) {
        lock(&self.state).recipients.insert(end_point, recipient);
    }

    fn unregister_recipient(&self, end_point: EndPoint) {
        lock(&self.state).recipients.remove(&end_point);
    }
}
