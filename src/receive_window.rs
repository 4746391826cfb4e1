use tokio::time::Instant;
use tracing::{debug, trace};

use crate::stream_header::window_exponent;

pub type ReadCallback = Box<dyn FnMut(&[u8]) + Send>;

/// What the receiver should do about a received chunk of stream data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDisposition {
    /// stored (or a duplicate of data received before): acknowledge it
    Ack,
    /// outside the receive window, or empty: the sender's retransmission takes care of it
    Ignore,
}

/// The receiving half of a stream: a fixed capacity buffer starting at the first byte not yet
///  delivered to the application, with a parallel bitmap of which bytes were received.
///
/// Data is delivered strictly in order - out-of-order data is buffered until the gap before it
///  is filled. Delivery requires a registered read callback; until there is one, received data
///  accumulates and shrinks the advertised window.
pub struct ReceiveWindow {
    buffer: Vec<u8>,
    received: Vec<bool>,
    /// stream offset of `buffer[0]`
    next_byte_expected: u64,
    /// number of `true` entries in `received`
    buffered_bytes: usize,
    read_callback: Option<ReadCallback>,
    last_receive_time: Option<Instant>,
}

impl ReceiveWindow {
    pub fn new(capacity: usize) -> ReceiveWindow {
        ReceiveWindow {
            buffer: vec![0; capacity],
            received: vec![false; capacity],
            next_byte_expected: 0,
            buffered_bytes: 0,
            read_callback: None,
            last_receive_time: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_byte_expected(&self) -> u64 {
        self.next_byte_expected
    }

    #[cfg(test)]
    pub fn last_contiguous_byte_received(&self) -> Option<u64> {
        self.next_byte_expected.checked_sub(1)
    }

    /// free space in bytes
    pub fn window_size(&self) -> usize {
        self.capacity() - self.buffered_bytes
    }

    pub fn window_exponent(&self) -> u8 {
        window_exponent(self.window_size())
    }

    pub fn last_receive_time(&self) -> Option<Instant> {
        self.last_receive_time
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive_time = Some(now);
    }

    /// Registers the callback data is delivered to, delivering anything buffered right away
    pub fn register_read_callback(&mut self, callback: ReadCallback) {
        self.read_callback = Some(callback);
        self.deliver();
    }

    pub fn receive(&mut self, offset: u64, data: &[u8]) -> ReceiveDisposition {
        if data.is_empty() {
            return ReceiveDisposition::Ignore;
        }

        let Some(end) = offset.checked_add(data.len() as u64) else {
            debug!("stream bytes at offset {} run past the end of the stream - dropping", offset);
            return ReceiveDisposition::Ignore;
        };
        if end <= self.next_byte_expected {
            trace!("duplicate of stream bytes {}..{}", offset, end);
            return ReceiveDisposition::Ack;
        }

        // drop a prefix that was delivered already
        let (offset, data) = if offset < self.next_byte_expected {
            let skip = (self.next_byte_expected - offset) as usize;
            (self.next_byte_expected, &data[skip..])
        }
        else {
            (offset, data)
        };

        let relative_offset = offset - self.next_byte_expected;
        if end - self.next_byte_expected > self.capacity() as u64 {
            trace!("stream bytes {}..{} are outside the receive window", offset, end);
            return ReceiveDisposition::Ignore;
        }
        let start = relative_offset as usize;
        let range = start..start + data.len();

        self.buffered_bytes += self.received[range.clone()].iter().filter(|r| !**r).count();
        self.buffer[range.clone()].copy_from_slice(data);
        self.received[range].fill(true);

        self.deliver();
        ReceiveDisposition::Ack
    }

    /// hands the contiguous run of bytes at the start of the window to the read callback and
    ///  slides the window past them
    fn deliver(&mut self) {
        let Some(read_callback) = self.read_callback.as_mut() else {
            return;
        };

        let ready = self.received.iter().take_while(|r| **r).count();
        if ready == 0 {
            return;
        }

        trace!("delivering stream bytes {}..{}", self.next_byte_expected, self.next_byte_expected + ready as u64);
        read_callback(&self.buffer[..ready]);

        let capacity = self.capacity();
        self.buffer.copy_within(ready.., 0);
        self.received.copy_within(ready.., 0);
        self.received[capacity - ready..].fill(false);

        self.next_byte_expected += ready as u64;
        self.buffered_bytes -= ready;
    }
}
