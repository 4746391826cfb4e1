use bit_set::BitSet;
use tracing::trace;

use crate::error::{SstError, SstResult};

/// Allocator for the 16 bit channel ID namespace. Channel ID 0 is reserved for requesting a new
///  channel and is never handed out.
pub struct ChannelIdAllocator {
    in_use: BitSet,
}

impl Default for ChannelIdAllocator {
    fn default() -> Self {
        ChannelIdAllocator::new()
    }
}

impl ChannelIdAllocator {
    pub fn new() -> ChannelIdAllocator {
        ChannelIdAllocator {
            in_use: BitSet::with_capacity(u16::MAX as usize + 1),
        }
    }

    /// Returns the highest free channel ID for which `is_eligible` holds, marking it as used.
    ///
    /// The predicate lets callers skip IDs that are free in the channel namespace but collide
    ///  with something else, e.g. a port that is already bound.
    pub fn allocate(&mut self, is_eligible: impl Fn(u16) -> bool) -> SstResult<u16> {
        for id in (1..=u16::MAX).rev() {
            if !self.in_use.contains(id as usize) && is_eligible(id) {
                self.in_use.insert(id as usize);
                trace!("allocated channel id {}", id);
                return Ok(id);
            }
        }
        Err(SstError::ChannelIdsExhausted)
    }

    pub fn release(&mut self, id: u16) {
        trace!("released channel id {}", id);
        self.in_use.remove(id as usize);
    }

    #[cfg(test)]
    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(id as usize)
    }

    #[cfg(test)]
    pub fn num_in_use(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_high_to_low() {
        let mut allocator = ChannelIdAllocator::new();
        assert_eq!(allocator.allocate(|_| true).unwrap(), 65535);
        assert_eq!(allocator.allocate(|_| true).unwrap(), 65534);
        allocator.release(65535);
        assert!(!allocator.is_in_use(65535));
        assert_eq!(allocator.allocate(|_| true).unwrap(), 65535);
        assert_eq!(allocator.num_in_use(), 2);
    }

    #[test]
    fn test_skips_ineligible() {
        let mut allocator = ChannelIdAllocator::new();
        assert_eq!(allocator.allocate(|id| id < 100).unwrap(), 99);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut allocator = ChannelIdAllocator::new();
        for _ in 0..u16::MAX {
            allocator.allocate(|_| true).unwrap();
        }
        assert!(!allocator.is_in_use(0));
        assert_eq!(allocator.allocate(|_| true), Err(SstError::ChannelIdsExhausted));

        allocator.release(4711);
        assert_eq!(allocator.allocate(|_| true).unwrap(), 4711);
    }
}
