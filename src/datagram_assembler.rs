use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

/// Reassembles datagrams that were split into several fragments. Fragments of a datagram share
///  the sender's LSID, carry their offset inside the datagram, and all but the last one are
///  flagged as 'continues'.
///
/// Datagrams are unreliable, so a missing fragment loses the whole datagram: a fragment that
///  does not continue exactly where the collected data ends discards what was collected.
pub struct DatagramAssembler {
    partial: BTreeMap<u16, BytesMut>,
    max_partial: usize,
}

impl DatagramAssembler {
    pub fn new(max_partial: usize) -> DatagramAssembler {
        DatagramAssembler {
            partial: BTreeMap::new(),
            max_partial,
        }
    }

    pub fn num_partial(&self) -> usize {
        self.partial.len()
    }

    /// Returns the complete datagram if `fragment` completes one
    pub fn on_fragment(&mut self, lsid: u16, offset: u64, continues: bool, fragment: &[u8]) -> Option<Bytes> {
        if offset == 0 {
            if self.partial.remove(&lsid).is_some() {
                debug!("datagram {} restarted - discarding incomplete data", lsid);
            }
            if !continues {
                return Some(Bytes::copy_from_slice(fragment));
            }
            self.partial.insert(lsid, BytesMut::from(fragment));
            self.evict_oldest();
            return None;
        }

        let Some(collected) = self.partial.get_mut(&lsid) else {
            trace!("fragment of datagram {} at offset {} without its start - dropping", lsid, offset);
            return None;
        };
        if collected.len() as u64 != offset {
            debug!("datagram {}: expected fragment at offset {}, got {} - dropping datagram", lsid, collected.len(), offset);
            self.partial.remove(&lsid);
            return None;
        }
        collected.extend_from_slice(fragment);

        if continues {
            return None;
        }
        self.partial.remove(&lsid).map(BytesMut::freeze)
    }

    /// LSIDs are assigned in ascending order, so the lowest one is the oldest
    fn evict_oldest(&mut self) {
        while self.partial.len() > self.max_partial {
            if let Some((lsid, _)) = self.partial.pop_first() {
                debug!("too many incomplete datagrams - discarding datagram {}", lsid);
            }
        }
    }
}
