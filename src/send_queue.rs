use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SstConfig;
use crate::error::ProtocolError;
use crate::rto::RtoEstimator;
use crate::stream_header::window_bytes;

/// A chunk of stream data, tagged with the absolute offset of its first byte in the stream
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub offset: u64,
    pub data: Bytes,
    pub transmit_time: Option<Instant>,
}

impl StreamBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The sending half of a stream: data written by the application and not yet sent, data sent
///  and not yet acknowledged, and the flow control and retransmission state governing both.
///
/// Data that was sent is tracked by the channel sequence number of the segment that carried it,
///  since that is what the peer acknowledges. `outstanding_bytes` is always the total length of
///  the buffers in `channel_to_buffer`.
pub struct SendQueue {
    queued: VecDeque<StreamBuffer>,
    queue_length: usize,
    max_queue_length: usize,
    max_payload_size: usize,
    next_write_offset: u64,

    channel_to_buffer: BTreeMap<u64, StreamBuffer>,
    /// Byte offsets of everything in `channel_to_buffer`, surviving a resend. A late ack for a
    ///  segment that was superseded by retransmission still identifies the data it carried.
    channel_to_offset: BTreeMap<u64, u64>,
    outstanding_bytes: u64,

    transmit_window: u64,
    advertised_window: u64,

    rto: RtoEstimator,
    max_rto: Duration,
    last_send_time: Option<Instant>,
}

impl SendQueue {
    /// `initial_offset` is the stream offset of the first byte written, i.e. the number of bytes
    ///  sent as part of the stream's Init packet
    pub fn new(config: &SstConfig, initial_offset: u64) -> SendQueue {
        SendQueue {
            queued: VecDeque::new(),
            queue_length: 0,
            max_queue_length: config.max_queue_length,
            max_payload_size: config.max_payload_size,
            next_write_offset: initial_offset,
            channel_to_buffer: BTreeMap::new(),
            channel_to_offset: BTreeMap::new(),
            outstanding_bytes: 0,
            transmit_window: config.max_receive_window as u64,
            advertised_window: config.max_receive_window as u64,
            rto: RtoEstimator::new(config.initial_rto, config.rto_alpha, config.min_rto),
            max_rto: config.max_stream_rto,
            last_send_time: None,
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    pub fn transmit_window(&self) -> u64 {
        self.transmit_window
    }

    pub fn advertised_window(&self) -> u64 {
        self.advertised_window
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn num_unacked(&self) -> usize {
        self.channel_to_buffer.len()
    }

    /// nothing queued, nothing waiting for an ack
    pub fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.channel_to_buffer.is_empty()
    }

    /// Queues as much of `data` as the queue budget allows, returning the number of bytes queued.
    ///
    /// Buffers moved back into the queue for resending count against the budget, and can take
    ///  the queue beyond it. Writes are refused until it has drained below the budget again.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let budget = self.max_queue_length.saturating_sub(self.queue_length);
        let num_bytes = data.len().min(budget);

        for chunk in data[..num_bytes].chunks(self.max_payload_size) {
            self.queued.push_back(StreamBuffer {
                offset: self.next_write_offset,
                data: Bytes::copy_from_slice(chunk),
                transmit_time: None,
            });
            self.next_write_offset += chunk.len() as u64;
        }
        self.queue_length += num_bytes;

        if num_bytes < data.len() {
            debug!("send queue full: queued {} of {} bytes", num_bytes, data.len());
        }
        num_bytes
    }

    /// Hands queued buffers to `send` for as long as the transmit window allows. `send` returns
    ///  the channel sequence number the buffer was sent with, or `None` if the channel did not
    ///  accept it. Returns the number of buffers sent.
    pub fn drain(&mut self, now: Instant, mut send: impl FnMut(&StreamBuffer) -> Option<u64>) -> usize {
        let mut num_sent = 0;
        loop {
            let Some(front) = self.queued.front() else {
                break;
            };
            if self.transmit_window < front.len() as u64 {
                break;
            }
            let Some(channel_sequence_number) = send(front) else {
                break;
            };
            let Some(mut buffer) = self.queued.pop_front() else {
                break;
            };

            trace!("sent stream bytes {}..{} as channel segment #{}", buffer.offset, buffer.offset + buffer.len() as u64, channel_sequence_number);

            self.queue_length -= buffer.len();
            self.transmit_window -= buffer.len() as u64;
            self.outstanding_bytes += buffer.len() as u64;
            buffer.transmit_time = Some(now);
            self.channel_to_offset.insert(channel_sequence_number, buffer.offset);
            self.channel_to_buffer.insert(channel_sequence_number, buffer);
            self.last_send_time = Some(now);
            num_sent += 1;
        }
        num_sent
    }

    /// Retransmission is due when nothing was sent for two RTOs while there is data waiting for
    ///  an ack, or while queued data is blocked by a transmit window too small for it.
    pub fn is_resend_due(&self, now: Instant) -> bool {
        let Some(last_send_time) = self.last_send_time else {
            return false;
        };
        if now.saturating_duration_since(last_send_time) < self.rto.rto() * 2 {
            return false;
        }

        !self.channel_to_buffer.is_empty()
            || self.queued.front().is_some_and(|b| b.len() as u64 > self.transmit_window)
    }

    /// Go-back-N: moves every unacknowledged buffer back to the front of the queue, in offset
    ///  order, and makes sure the transmit window lets the biggest of them through.
    pub fn resend_unacked(&mut self, now: Instant) {
        let mut unacked: Vec<StreamBuffer> = std::mem::take(&mut self.channel_to_buffer)
            .into_values()
            .collect();
        unacked.sort_by_key(|b| b.offset);
        unacked.dedup_by_key(|b| b.offset);

        if !unacked.is_empty() {
            self.rto.back_off(self.max_rto);
            debug!("resending {} unacked buffers, stream RTO is now {:?}", unacked.len(), self.rto.rto());
        }

        let mut min_window = self.queued.front().map(|b| b.len() as u64).unwrap_or(0);
        for mut buffer in unacked.into_iter().rev() {
            min_window = min_window.max(buffer.len() as u64);
            self.queue_length += buffer.len();
            buffer.transmit_time = None;
            self.queued.push_front(buffer);
        }

        self.outstanding_bytes = 0;
        self.transmit_window = self.transmit_window.max(min_window);
        self.last_send_time = Some(now);
    }

    /// Processes an ack for the channel segment `ack_sequence_number` carrying the peer's
    ///  current window, returning whether the ack matched data sent by this stream.
    pub fn on_ack(&mut self, ack_sequence_number: u64, window_exponent: u8, now: Instant) -> Result<bool, ProtocolError> {
        let matched = if let Some(buffer) = self.channel_to_buffer.remove(&ack_sequence_number) {
            if let Some(rtt) = buffer.transmit_time.and_then(|t| now.checked_duration_since(t)) {
                self.rto.on_sample(rtt);
            }
            self.outstanding_bytes -= buffer.len() as u64;
            self.acknowledge_offset(buffer.offset);
            true
        }
        else if let Some(offset) = self.channel_to_offset.get(&ack_sequence_number).copied() {
            trace!("late ack for segment #{}, acknowledging offset {}", ack_sequence_number, offset);
            self.acknowledge_offset(offset);
            true
        }
        else {
            false
        };

        self.update_window(window_exponent)?;
        Ok(matched)
    }

    /// removes all traces of the buffer starting at `offset`: further copies in flight, a copy
    ///  queued for resending, and the offset bookkeeping
    fn acknowledge_offset(&mut self, offset: u64) {
        let mut released = 0;
        self.channel_to_buffer.retain(|_, b| {
            if b.offset == offset {
                released += b.len() as u64;
                false
            }
            else {
                true
            }
        });
        self.outstanding_bytes -= released;

        let mut dequeued = 0;
        self.queued.retain(|b| {
            if b.offset == offset {
                dequeued += b.len();
                false
            }
            else {
                true
            }
        });
        self.queue_length -= dequeued;

        self.channel_to_offset.retain(|_, o| *o != offset);
    }

    /// Sets the transmit window from the window the peer advertised, minus what is in flight
    pub fn update_window(&mut self, window_exponent: u8) -> Result<(), ProtocolError> {
        let advertised = window_bytes(window_exponent);
        self.advertised_window = advertised;

        match advertised.checked_sub(self.outstanding_bytes) {
            Some(transmit_window) => {
                self.transmit_window = transmit_window;
                Ok(())
            }
            None => {
                self.transmit_window = 0;
                Err(ProtocolError::WindowUnderflow {
                    advertised,
                    outstanding: self.outstanding_bytes,
                })
            }
        }
    }

    pub fn clear(&mut self) {
        self.queued.clear();
        self.queue_length = 0;
        self.channel_to_buffer.clear();
        self.channel_to_offset.clear();
        self.outstanding_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn queue() -> SendQueue {
        SendQueue::new(&SstConfig::default(), 0)
    }

    /// drains into a fake channel numbering segments from `first_sequence_number`
    fn drain(queue: &mut SendQueue, now: Instant, first_sequence_number: u64) -> Vec<(u64, u64, usize)> {
        let mut sent = Vec::new();
        let mut next = first_sequence_number;
        queue.drain(now, |b| {
            sent.push((next, b.offset, b.len()));
            next += 1;
            Some(next - 1)
        });
        sent
    }

    #[rstest]
    #[case::small(100, 100, 1)]
    #[case::exact_payload(1000, 1000, 1)]
    #[case::chunked(2500, 2500, 3)]
    #[case::exactly_max_queue_length(4_000_000, 4_000_000, 4000)]
    #[case::one_byte_over(4_000_001, 4_000_000, 4000)]
    fn test_write(#[case] len: usize, #[case] expected_queued: usize, #[case] expected_buffers: usize) {
        let mut queue = queue();
        assert_eq!(queue.write(&vec![7u8; len]), expected_queued);
        assert_eq!(queue.queue_length(), expected_queued);
        assert_eq!(queue.queued.len(), expected_buffers);
    }

    #[test]
    fn test_write_into_full_queue() {
        let mut queue = queue();
        assert_eq!(queue.write(&vec![0u8; 3_999_999]), 3_999_999);
        assert_eq!(queue.write(b"ab"), 1);
        assert_eq!(queue.write(b"c"), 0);
    }

    #[test]
    fn test_write_offsets_start_after_initial_data() {
        let mut queue = SendQueue::new(&SstConfig::default(), 1000);
        queue.write(&[1u8; 1500]);
        let offsets: Vec<u64> = queue.queued.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![1000, 2000]);
    }

    #[test]
    fn test_drain_respects_transmit_window() {
        let mut queue = queue();
        queue.update_window(11).unwrap(); // 2048 bytes
        queue.write(&[0u8; 5000]);

        let sent = drain(&mut queue, Instant::now(), 1);
        assert_eq!(sent, vec![(1, 0, 1000), (2, 1000, 1000)]);
        assert_eq!(queue.transmit_window(), 48);
        assert_eq!(queue.outstanding_bytes(), 2000);
        assert_eq!(queue.queue_length(), 3000);
    }

    #[test]
    fn test_drain_stops_when_channel_refuses() {
        let mut queue = queue();
        queue.write(&[0u8; 3000]);
        let mut calls = 0;
        let num_sent = queue.drain(Instant::now(), |_| {
            calls += 1;
            if calls == 1 { Some(1) } else { None }
        });
        assert_eq!(num_sent, 1);
        assert_eq!(queue.queue_length(), 2000);
        assert_eq!(queue.outstanding_bytes(), 1000);
    }

    #[test]
    fn test_ack_keeps_window_invariant() {
        let mut queue = queue();
        queue.write(&[0u8; 5000]);
        let now = Instant::now();
        let sent = drain(&mut queue, now, 1);
        assert_eq!(sent.len(), 5);

        for (i, (sequence_number, _, _)) in sent.iter().enumerate() {
            let window_exponent = 13 - (i % 2) as u8;
            assert_eq!(queue.on_ack(*sequence_number, window_exponent, now + Duration::from_millis(50)), Ok(true));
            assert_eq!(queue.transmit_window() + queue.outstanding_bytes(), window_bytes(window_exponent));
        }
        assert!(queue.is_drained());
        assert_eq!(queue.rto(), Duration::from_millis(50));
    }

    #[test]
    fn test_ack_with_window_below_outstanding() {
        let mut queue = queue();
        queue.write(&[0u8; 3000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);

        let result = queue.on_ack(1, 10, now);
        assert_eq!(result, Err(ProtocolError::WindowUnderflow { advertised: 1024, outstanding: 2000 }));
        assert_eq!(queue.transmit_window(), 0);
        assert_eq!(queue.outstanding_bytes(), 2000);
    }

    #[test]
    fn test_unknown_ack_only_updates_window() {
        let mut queue = queue();
        queue.write(&[0u8; 1000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);
        assert_eq!(queue.on_ack(0, 12, now), Ok(false));
        assert_eq!(queue.transmit_window(), 4096 - 1000);
        assert_eq!(queue.num_unacked(), 1);
    }

    #[test]
    fn test_resend_is_go_back_n() {
        let mut queue = queue();
        queue.write(&[0u8; 3000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);
        queue.on_ack(2, 13, now + Duration::from_millis(100)).unwrap();

        assert!(!queue.is_resend_due(now + Duration::from_millis(150)));
        let later = now + Duration::from_millis(250);
        assert!(queue.is_resend_due(later));

        queue.resend_unacked(later);
        assert_eq!(queue.outstanding_bytes(), 0);
        assert_eq!(queue.queue_length(), 2000);
        assert_eq!(queue.rto(), Duration::from_millis(200));
        let offsets: Vec<u64> = queue.queued.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 2000]);

        let resent = drain(&mut queue, later, 10);
        assert_eq!(resent, vec![(10, 0, 1000), (11, 2000, 1000)]);
    }

    #[test]
    fn test_resend_opens_window_for_biggest_buffer() {
        let mut queue = queue();
        queue.write(&[0u8; 1000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);
        let _ = queue.update_window(0);
        assert_eq!(queue.transmit_window(), 0);

        queue.resend_unacked(now + Duration::from_secs(5));
        assert_eq!(queue.transmit_window(), 1000);
        assert_eq!(drain(&mut queue, now + Duration::from_secs(5), 2).len(), 1);
    }

    #[test]
    fn test_late_ack_after_resend() {
        let mut queue = queue();
        queue.write(&[0u8; 2000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);
        queue.resend_unacked(now + Duration::from_secs(5));
        drain(&mut queue, now + Duration::from_secs(5), 10);
        assert_eq!(queue.outstanding_bytes(), 2000);

        // the ack for the first transmission of offset 0 arrives late
        assert_eq!(queue.on_ack(1, 13, now + Duration::from_secs(6)), Ok(true));
        assert_eq!(queue.outstanding_bytes(), 1000);
        assert_eq!(queue.num_unacked(), 1);

        assert_eq!(queue.on_ack(11, 13, now + Duration::from_secs(6)), Ok(true));
        assert!(queue.is_drained());
    }

    #[test]
    fn test_late_ack_removes_buffer_queued_for_resend() {
        let mut queue = queue();
        queue.write(&[0u8; 2000]);
        let now = Instant::now();
        drain(&mut queue, now, 1);
        queue.resend_unacked(now + Duration::from_secs(5));
        assert_eq!(queue.queue_length(), 2000);

        assert_eq!(queue.on_ack(2, 13, now + Duration::from_secs(6)), Ok(true));
        assert_eq!(queue.queue_length(), 1000);
        assert_eq!(queue.queued.front().map(|b| b.offset), Some(0));
    }

    #[test]
    fn test_resend_into_full_queue_refuses_writes() {
        let mut queue = queue();
        assert_eq!(queue.write(&vec![0u8; 4_000_000]), 4_000_000);
        let now = Instant::now();
        let mut num_sent = 0;
        queue.drain(now, |_| {
            num_sent += 1;
            if num_sent <= 10 { Some(num_sent) } else { None }
        });
        assert_eq!(queue.queue_length(), 3_990_000);
        assert_eq!(queue.write(&vec![0u8; 10_000]), 10_000);

        queue.resend_unacked(now + Duration::from_secs(5));
        assert_eq!(queue.queue_length(), 4_010_000);
        assert_eq!(queue.write(b"x"), 0);

        // acks for the original transmissions bring the queue back under its budget
        for sequence_number in 1..=10 {
            assert_eq!(queue.on_ack(sequence_number, 13, now + Duration::from_secs(6)), Ok(true));
        }
        assert_eq!(queue.queue_length(), 4_000_000);
        assert_eq!(queue.write(b"x"), 0);
        drain(&mut queue, now + Duration::from_secs(6), 100);
        assert_eq!(queue.write(b"x"), 1);
    }

    #[test]
    fn test_clear() {
        let mut queue = queue();
        queue.write(&[0u8; 2000]);
        drain(&mut queue, Instant::now(), 1);
        queue.write(&[0u8; 10]);
        queue.clear();
        assert!(queue.is_drained());
        assert_eq!(queue.outstanding_bytes(), 0);
        assert_eq!(queue.queue_length(), 0);
    }
}
