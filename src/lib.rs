//! SST: reliable, ordered, multiplexed byte streams on top of an unreliable datagram substrate.
//!
//! Two end points share a *connection*, which owns one *channel*: channel IDs at both ends, a
//!  transmit sequence, a congestion window and an RTO estimate. A connection multiplexes any
//!  number of *streams*, each of them an ordered, reliable byte stream with its own flow control
//!  and retransmission. Streams can have child streams, and connections can carry unreliable
//!  datagrams.
//!
//! The datagram substrate is abstracted as [datagram_layer::DatagramLayer]. All connections
//!  that share a substrate are managed by a [registry::Registry], which is driven by
//!  [registry::Registry::service] ticks (see [poller::Poller]) and by arriving datagrams.
//!
//! ## Wire format
//!
//! Every packet starts with a channel header (see [channel_header::ChannelHeader]). Packets on
//!  channel 0 are channel negotiation: a request carries the channel ID the requester chose for
//!  itself, the reply the acceptor's channel ID and the port of the connection it created for
//!  the request. All other packets carry a stream header (see [stream_header::StreamHeader])
//!  followed by stream payload, or nothing at all for bare channel-level acks.
//!
//! ## Windows
//!
//! Receive windows are advertised as `round(log2(free bytes))` in a single byte, and the sender
//!  keeps `transmit window = 2^exponent - outstanding bytes`.

pub mod buf_ext;
pub mod callbacks;
pub mod channel;
pub mod channel_header;
pub mod channel_ids;
pub mod config;
pub mod connection;
pub mod datagram_assembler;
pub mod datagram_layer;
pub mod end_point;
pub mod error;
pub mod loopback;
pub mod outbox;
pub mod poller;
pub mod receive_window;
pub mod registry;
pub mod rto;
pub mod send_queue;
pub mod stream;
pub mod stream_header;
mod util;

#[cfg(test)] pub mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
