use thiserror::Error;

use crate::end_point::EndPoint;

pub type SstResult<T> = Result<T, SstError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SstError {
    #[error("end point {0} is already bound")]
    EndPointInUse(EndPoint),
    #[error("there is already a listener on {0}")]
    ListenerExists(EndPoint),
    #[error("all channel IDs are in use")]
    ChannelIdsExhausted,
    #[error("all stream IDs of the connection are in use")]
    LsidsExhausted,
    #[error("connect to {0} timed out")]
    ConnectTimeout(EndPoint),
    #[error("stream handshake failed")]
    StreamConnectFailed,
    #[error("connection is closed or closing")]
    ConnectionClosed,
    #[error("stream is closed or closing")]
    StreamClosed,
    #[error("no connection for {0}")]
    UnknownConnection(EndPoint),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Conditions that can only arise from a misbehaving peer or a bug. The packet that caused them
///  is dropped, the connection otherwise carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("peer advertised a window of {advertised} bytes with {outstanding} bytes outstanding")]
    WindowUnderflow { advertised: u64, outstanding: u64 },
    #[error("packet for channel {actual} arrived on channel {expected}")]
    UnexpectedChannel { expected: u16, actual: u16 },
    #[error("malformed channel negotiation payload")]
    MalformedNegotiation,
}
