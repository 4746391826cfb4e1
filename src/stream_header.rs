use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf_ext::BufExt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamPacketType {
    Init = 0,
    Reply = 1,
    Data = 2,
    Ack = 3,
    Datagram = 4,
}

/// Type specific part of a stream header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamPacketKind {
    /// opens a stream; may carry the first bytes of the stream's data
    Init { parent_lsid: u16, byte_sequence_number: u64 },
    Reply { reply_to_lsid: u16 },
    Data { byte_sequence_number: u64 },
    Ack,
    /// a fragment of an unreliable datagram, `offset` being its position in the datagram
    Datagram { offset: u64 },
}

impl StreamPacketKind {
    pub fn packet_type(&self) -> StreamPacketType {
        match self {
            StreamPacketKind::Init { .. } => StreamPacketType::Init,
            StreamPacketKind::Reply { .. } => StreamPacketType::Reply,
            StreamPacketKind::Data { .. } => StreamPacketType::Data,
            StreamPacketKind::Ack => StreamPacketType::Ack,
            StreamPacketKind::Datagram { .. } => StreamPacketType::Datagram,
        }
    }
}

/// The header of a stream packet, carried as the payload of a channel packet.
///
/// ```ascii
/// 0: lsid (u16) - the sender's id for the stream
/// 2: packet type (u8)
/// 3: flags (u8)
/// 4: window (u8) - log2 of the sender's receive window in bytes
/// 5: source port (u16)
/// 7: destination port (u16)
/// 9: type specific:
///     Init: parent lsid (u16), byte sequence number (varint u64)
///     Reply: reply-to lsid (u16)
///     Data: byte sequence number (varint u64)
///     Ack: -
///     Datagram: offset inside the datagram (varint u64)
/// *: payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHeader {
    pub lsid: u16,
    pub flags: u8,
    pub window: u8,
    pub src_port: u16,
    pub dest_port: u16,
    pub kind: StreamPacketKind,
}

impl StreamHeader {
    /// set on every fragment of a datagram except the last one
    pub const FLAG_CONTINUES: u8 = 1;

    pub fn continues(&self) -> bool {
        self.flags & Self::FLAG_CONTINUES != 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.lsid);
        buf.put_u8(self.kind.packet_type().into());
        buf.put_u8(self.flags);
        buf.put_u8(self.window);
        buf.put_u16(self.src_port);
        buf.put_u16(self.dest_port);

        match self.kind {
            StreamPacketKind::Init { parent_lsid, byte_sequence_number } => {
                buf.put_u16(parent_lsid);
                buf.put_u64_varint(byte_sequence_number);
            }
            StreamPacketKind::Reply { reply_to_lsid } => {
                buf.put_u16(reply_to_lsid);
            }
            StreamPacketKind::Data { byte_sequence_number } => {
                buf.put_u64_varint(byte_sequence_number);
            }
            StreamPacketKind::Ack => {}
            StreamPacketKind::Datagram { offset } => {
                buf.put_u64_varint(offset);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StreamHeader> {
        let lsid = buf.get_checked_u16()?;
        let raw_type = buf.get_checked_u8()?;
        let packet_type = StreamPacketType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid stream packet type {}", raw_type))?;
        let flags = buf.get_checked_u8()?;
        let window = buf.get_checked_u8()?;
        let src_port = buf.get_checked_u16()?;
        let dest_port = buf.get_checked_u16()?;

        let kind = match packet_type {
            StreamPacketType::Init => StreamPacketKind::Init {
                parent_lsid: buf.get_checked_u16()?,
                byte_sequence_number: buf.try_get_u64_varint()?,
            },
            StreamPacketType::Reply => StreamPacketKind::Reply {
                reply_to_lsid: buf.get_checked_u16()?,
            },
            StreamPacketType::Data => StreamPacketKind::Data {
                byte_sequence_number: buf.try_get_u64_varint()?,
            },
            StreamPacketType::Ack => StreamPacketKind::Ack,
            StreamPacketType::Datagram => StreamPacketKind::Datagram {
                offset: buf.try_get_u64_varint()?,
            },
        };

        Ok(StreamHeader {
            lsid,
            flags,
            window,
            src_port,
            dest_port,
            kind,
        })
    }

    pub fn to_bytes(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(24 + payload.len());
        self.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn parse(mut packet: Bytes) -> anyhow::Result<(StreamHeader, Bytes)> {
        let header = StreamHeader::deser(&mut packet)?;
        Ok((header, packet))
    }
}

/// Encodes a window size in bytes as the exponent sent on the wire, `round(log2(bytes))`.
///  There is no way to represent a window of zero bytes, so it is advertised as a single byte.
pub fn window_exponent(window_bytes: usize) -> u8 {
    if window_bytes <= 1 {
        return 0;
    }
    (window_bytes as f64).log2().round() as u8
}

pub fn window_bytes(exponent: u8) -> u64 {
    1u64 << exponent.min(63)
}
