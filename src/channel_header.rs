use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::buf_ext::BufExt;

/// The outer header of every packet a connection sends. The payload (whatever remains in the
///  packet after the header) is either a stream packet, or for channel 0 a negotiation payload.
///
/// ```ascii
/// 0: channel id (u16) - 0 marks a request for a new channel
/// 2: transmit sequence number (varint u64)
/// *: ack count (varint u32) - always 1
/// *: ack sequence number (varint u64)
/// *: payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelHeader {
    pub channel_id: u16,
    pub transmit_sequence_number: u64,
    pub ack_count: u32,
    pub ack_sequence_number: u64,
}

impl ChannelHeader {
    pub const NEW_CHANNEL_REQUEST: u16 = 0;

    pub fn new(channel_id: u16, transmit_sequence_number: u64, ack_sequence_number: u64) -> ChannelHeader {
        ChannelHeader {
            channel_id,
            transmit_sequence_number,
            ack_count: 1,
            ack_sequence_number,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.channel_id);
        buf.put_u64_varint(self.transmit_sequence_number);
        buf.put_u32_varint(self.ack_count);
        buf.put_u64_varint(self.ack_sequence_number);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChannelHeader> {
        let channel_id = buf.get_checked_u16()?;
        let transmit_sequence_number = buf.try_get_u64_varint()?;
        let ack_count = buf.try_get_u32_varint()?;
        let ack_sequence_number = buf.try_get_u64_varint()?;

        Ok(ChannelHeader {
            channel_id,
            transmit_sequence_number,
            ack_count,
            ack_sequence_number,
        })
    }

    /// serializes this header followed by `payload` into a packet ready for the substrate
    pub fn to_packet(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + payload.len());
        self.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// splits a received packet into its channel header and its payload
    pub fn parse_packet(mut packet: Bytes) -> anyhow::Result<(ChannelHeader, Bytes)> {
        let header = ChannelHeader::deser(&mut packet)?;
        Ok((header, packet))
    }
}

/// Payload of channel-0 negotiation: the request carries the channel ID the connecting side
///  chose for itself, the reply the acceptor's channel ID and the port its new connection is
///  bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelNegotiation {
    pub channel_id: u16,
    pub port: Option<u16>,
}

impl ChannelNegotiation {
    pub fn request(channel_id: u16) -> ChannelNegotiation {
        ChannelNegotiation { channel_id, port: None }
    }

    pub fn reply(channel_id: u16, port: u16) -> ChannelNegotiation {
        ChannelNegotiation { channel_id, port: Some(port) }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.channel_id);
        if let Some(port) = self.port {
            buf.put_u16(port);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChannelNegotiation> {
        let channel_id = buf.get_checked_u16()?;
        if channel_id == ChannelHeader::NEW_CHANNEL_REQUEST {
            bail!("negotiated channel id must not be 0");
        }

        let port = if buf.has_remaining() {
            Some(buf.get_checked_u16()?)
        }
        else {
            None
        };

        Ok(ChannelNegotiation { channel_id, port })
    }
}
