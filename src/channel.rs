use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel_header::ChannelHeader;
use crate::config::SstConfig;
use crate::end_point::EndPoint;
use crate::outbox::Outbox;
use crate::rto::RtoEstimator;

/// A payload queued for or in transit on the channel, tagged with the transmit sequence number
///  it was assigned when it was queued
#[derive(Debug)]
struct ChannelSegment {
    sequence_number: u64,
    payload: Bytes,
    transmit_time: Option<Instant>,
}

/// The channel level state of a connection: sequencing, the queued and in-flight segment FIFOs
///  and congestion control.
///
/// Congestion control is deliberately simple. Up to `cwnd` segments are sent in a burst, after
///  which the channel waits for an ack ('waiting mode'). An ack matching an in-flight segment
///  returns the channel to sending mode and grows `cwnd` by one with probability `1/cwnd`. If no
///  ack arrives within the RTO, `cwnd` is halved and all in-flight segments are forgotten -
///  there is no resending at channel level, streams take care of their own retransmission.
pub struct Channel {
    pub remote_end_point: EndPoint,
    pub remote_channel_id: u16,

    next_transmit_sequence_number: u64,
    last_received_sequence_number: u64,

    queued: VecDeque<ChannelSegment>,
    in_flight: VecDeque<ChannelSegment>,
    max_queued_segments: usize,

    cwnd: u32,
    /// number of distinct segments ever sent from the queue, bounding `cwnd` growth
    segments_sent: u64,
    rto: RtoEstimator,
    sending_mode: bool,
    last_transmit_time: Option<Instant>,

    rng: StdRng,
}

impl Channel {
    pub fn new(config: &SstConfig, remote_end_point: EndPoint, remote_channel_id: u16) -> Channel {
        Channel {
            remote_end_point,
            remote_channel_id,
            next_transmit_sequence_number: 1,
            last_received_sequence_number: 0,
            queued: VecDeque::new(),
            in_flight: VecDeque::new(),
            max_queued_segments: config.max_queued_segments,
            cwnd: 1,
            segments_sent: 0,
            rto: RtoEstimator::new(config.initial_rto, config.rto_alpha, config.min_rto),
            sending_mode: true,
            last_transmit_time: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    #[cfg(test)]
    pub fn segments_sent(&self) -> u64 {
        self.segments_sent
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn num_queued(&self) -> usize {
        self.queued.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }

    fn next_sequence_number(&mut self) -> u64 {
        let result = self.next_transmit_sequence_number;
        self.next_transmit_sequence_number += 1;
        result
    }

    /// Queues a payload for sending, returning the transmit sequence number it will carry, or
    ///  `None` if the queue is full.
    pub fn enqueue(&mut self, payload: Bytes) -> Option<u64> {
        if self.queued.len() >= self.max_queued_segments {
            debug!("channel queue to {:?} is full - not queueing segment", self.remote_end_point);
            return None;
        }

        let sequence_number = self.next_sequence_number();
        self.queued.push_back(ChannelSegment {
            sequence_number,
            payload,
            transmit_time: None,
        });
        Some(sequence_number)
    }

    /// Sends a payload right away, bypassing queue and congestion window. This is for acks and
    ///  handshake packets, which are small and which nobody waits for at channel level.
    pub fn send_immediately(&mut self, local: EndPoint, channel_id: u16, ack_sequence_number: u64, payload: &[u8], outbox: &mut Outbox) -> u64 {
        let sequence_number = self.next_sequence_number();
        let header = ChannelHeader::new(channel_id, sequence_number, ack_sequence_number);
        trace!("sending unqueued channel packet #{} to {:?}", sequence_number, self.remote_end_point);
        outbox.send(local, self.remote_end_point, header.to_packet(payload));
        sequence_number
    }

    /// channel level processing of a received packet's header
    pub fn on_received(&mut self, header: &ChannelHeader, now: Instant) {
        self.last_received_sequence_number = header.transmit_sequence_number;
        self.on_ack(header.ack_sequence_number, now);
    }

    fn on_ack(&mut self, ack_sequence_number: u64, now: Instant) {
        let Some(pos) = self.in_flight.iter().position(|s| s.sequence_number == ack_sequence_number) else {
            return;
        };
        let Some(segment) = self.in_flight.remove(pos) else {
            return;
        };

        if let Some(rtt) = segment.transmit_time.and_then(|t| now.checked_duration_since(t)) {
            self.rto.on_sample(rtt);
        }

        if (self.cwnd as u64) < self.segments_sent && self.rng.gen_ratio(1, self.cwnd) {
            self.cwnd += 1;
            trace!("cwnd to {:?} grew to {}", self.remote_end_point, self.cwnd);
        }
        self.sending_mode = true;
    }

    pub fn service(&mut self, local: EndPoint, now: Instant, outbox: &mut Outbox) {
        if !self.sending_mode {
            let Some(last_transmit) = self.last_transmit_time else {
                self.sending_mode = true;
                return self.send_window(local, now, outbox);
            };
            if now.saturating_duration_since(last_transmit) < self.rto.rto() {
                return;
            }
            if !self.in_flight.is_empty() {
                self.back_off();
            }
            self.sending_mode = true;
        }
        self.send_window(local, now, outbox);
    }

    fn back_off(&mut self) {
        self.cwnd = (self.cwnd / 2).max(1);
        debug!("no ack from {:?} within RTO: discarding {} in-flight segments, cwnd is now {}", self.remote_end_point, self.in_flight.len(), self.cwnd);
        self.in_flight.clear();
    }

    fn send_window(&mut self, local: EndPoint, now: Instant, outbox: &mut Outbox) {
        let mut sent_something = false;
        while self.in_flight.len() < self.cwnd as usize {
            let Some(mut segment) = self.queued.pop_front() else {
                break;
            };

            let header = ChannelHeader::new(self.remote_channel_id, segment.sequence_number, self.last_received_sequence_number);
            trace!("sending channel packet #{} to {:?}", segment.sequence_number, self.remote_end_point);
            outbox.send(local, self.remote_end_point, header.to_packet(&segment.payload));

            segment.transmit_time = Some(now);
            self.in_flight.push_back(segment);
            self.segments_sent += 1;
            sent_something = true;
        }

        if sent_something {
            self.sending_mode = false;
            self.last_transmit_time = Some(now);
        }
    }

    /// drops everything queued or in flight
    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}
