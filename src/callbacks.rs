use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::SstResult;
use crate::stream::Stream;

pub use crate::receive_window::ReadCallback;

/// outcome of a connect request
pub type ConnectCallback = Box<dyn FnOnce(SstResult<Arc<Connection>>) + Send>;

/// outcome of opening a stream
pub type StreamCallback = Box<dyn FnOnce(SstResult<Arc<Stream>>) + Send>;

/// called for every stream a peer opens on a listening port
pub type StreamListener = Arc<dyn Fn(Arc<Stream>) + Send + Sync>;

/// called with every complete datagram arriving on a port
pub type DatagramListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// called once a datagram was handed to the connection (not when it arrived), with the
///  datagram's data
pub type DatagramSentCallback = Box<dyn FnOnce(SstResult<()>, Bytes) + Send>;
