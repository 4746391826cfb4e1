use std::time::Duration;

use anyhow::bail;

#[derive(Clone, Debug)]
pub struct SstConfig {
    /// Maximum number of stream payload bytes in a single packet (Data, Init or a datagram
    ///  fragment). Writes and datagrams bigger than this are split into several packets.
    ///
    /// Stream and channel headers are added on top of this, and the substrate must be able to
    ///  carry the result without fragmentation of its own.
    pub max_payload_size: usize,

    /// This is the maximum number of bytes a stream keeps queued for sending (i.e. written by
    ///  the application but not yet handed to the connection). Writes beyond this are short.
    pub max_queue_length: usize,

    /// Capacity of each stream's receive buffer in bytes. This bounds how far ahead of the
    ///  first missing byte a peer may send, and is the basis for the advertised window.
    pub max_receive_window: usize,

    /// Upper bound for the number of segments a connection queues for sending before it starts
    ///  dropping new ones.
    pub max_queued_segments: usize,

    /// RTO for connections and streams before the first RTT sample
    pub initial_rto: Duration,
    /// Upper bound for the stream RTO when it is doubled because of retransmission
    pub max_stream_rto: Duration,
    pub min_rto: Duration,
    /// weight of the old value in the exponentially weighted moving average of RTO samples
    pub rto_alpha: f64,

    pub max_init_retransmissions: u32,
    /// number of channel-0 negotiation packets sent before a connect attempt fails
    pub max_connect_attempts: u32,

    /// The interval at which the poller calls [crate::registry::Registry::service]. This is the
    ///  granularity of all protocol timers.
    pub service_interval: Duration,

    /// A connected stream that has not sent anything for this long sends a keep-alive ack
    pub keep_alive_interval: Duration,
    /// A stream that has not received anything for this long is closed forcibly
    pub stream_inactivity_timeout: Duration,
    /// A connected connection without streams is closed after this time
    pub connection_idle_timeout: Duration,

    pub max_partial_datagrams: usize,
}

impl Default for SstConfig {
    fn default() -> SstConfig {
        SstConfig {
            max_payload_size: 1000,
            max_queue_length: 4_000_000,
            max_receive_window: 10_000,
            max_queued_segments: 3000,
            initial_rto: Duration::from_secs(2),
            max_stream_rto: Duration::from_secs(20),
            min_rto: Duration::from_millis(1),
            rto_alpha: 0.8,
            max_init_retransmissions: 5,
            max_connect_attempts: 5,
            service_interval: Duration::from_millis(100),
            keep_alive_interval: Duration::from_secs(60),
            stream_inactivity_timeout: Duration::from_secs(300),
            connection_idle_timeout: Duration::from_secs(300),
            max_partial_datagrams: 64,
        }
    }
}

impl SstConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if self.max_receive_window == 0 || self.max_receive_window > 1 << 30 {
            bail!("receive window must be between 1 and 2^30 bytes");
        }
        if self.max_payload_size > self.max_receive_window {
            bail!("max payload size {} does not fit into the receive window {}", self.max_payload_size, self.max_receive_window);
        }
        if self.max_queue_length < self.max_payload_size {
            bail!("max queue length must hold at least one full payload");
        }
        if self.max_queued_segments == 0 {
            bail!("max queued segments must be positive");
        }
        if !(0.0..1.0).contains(&self.rto_alpha) {
            bail!("RTO alpha must be in [0, 1)");
        }
        if self.initial_rto.is_zero() || self.initial_rto > self.max_stream_rto {
            bail!("initial RTO must be positive and not exceed the max stream RTO");
        }
        if self.min_rto > self.initial_rto {
            bail!("min RTO must not exceed the initial RTO");
        }
        if self.service_interval.is_zero() {
            bail!("service interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(SstConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_payload(|c: &mut SstConfig| c.max_payload_size = 0)]
    #[case::payload_exceeds_window(|c: &mut SstConfig| c.max_payload_size = 20_000)]
    #[case::zero_window(|c: &mut SstConfig| c.max_receive_window = 0)]
    #[case::queue_too_short(|c: &mut SstConfig| c.max_queue_length = 999)]
    #[case::no_segments(|c: &mut SstConfig| c.max_queued_segments = 0)]
    #[case::alpha_one(|c: &mut SstConfig| c.rto_alpha = 1.0)]
    #[case::alpha_negative(|c: &mut SstConfig| c.rto_alpha = -0.1)]
    #[case::zero_rto(|c: &mut SstConfig| c.initial_rto = Duration::ZERO)]
    #[case::rto_above_cap(|c: &mut SstConfig| c.initial_rto = Duration::from_secs(30))]
    #[case::min_rto_above_initial(|c: &mut SstConfig| c.min_rto = Duration::from_secs(3))]
    #[case::zero_interval(|c: &mut SstConfig| c.service_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut SstConfig)) {
        let mut config = SstConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
