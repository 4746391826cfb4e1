use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::callbacks::{DatagramSentCallback, StreamCallback, StreamListener};
use crate::config::SstConfig;
use crate::connection::Connection;
use crate::end_point::EndPoint;
use crate::error::{ProtocolError, SstError, SstResult};
use crate::outbox::Outbox;
use crate::receive_window::{ReceiveDisposition, ReceiveWindow};
use crate::registry::Registry;
use crate::send_queue::SendQueue;
use crate::stream_header::{StreamHeader, StreamPacketKind};
use crate::util::lock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    PendingConnect,
    Connected,
    PendingDisconnect,
    Disconnected,
}

/// result of a stream's per-tick service, telling the connection what to do with the stream
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum StreamTick {
    Alive,
    /// the stream is done and should be erased
    Disconnected,
    /// this is the connection's root stream, and it failed to connect
    RootConnectFailed,
}

/// how a stream came into existence
pub(crate) enum StreamOrigin {
    /// opened by this side: the stream sends Init packets until the peer replies
    Local {
        initial_data: Bytes,
        callback: StreamCallback,
    },
    /// opened by the peer's Init packet
    Remote {
        remote_lsid: u16,
    },
}

/// the parts of a stream's identity that are fixed at creation
pub(crate) struct StreamIds {
    pub lsid: u16,
    pub parent_lsid: u16,
    pub local_port: u16,
    pub remote_port: u16,
    /// the local end point of the owning connection
    pub connection: EndPoint,
}

/// Guarded by the stream's queue lock: the stream's state machine and everything on the
///  sending side
struct StreamControl {
    state: StreamState,
    remote_lsid: Option<u16>,

    init_attempts: u32,
    last_init_time: Option<Instant>,
    initial_data: Bytes,
    creation_callback: Option<StreamCallback>,

    /// last time this stream sent anything, for keep-alive
    last_activity: Instant,

    send: SendQueue,
}

/// One ordered, reliable byte stream multiplexed over a connection.
///
/// A stream is owned by its connection. It refers back to the connection only by the
///  connection's local end point, resolving it through the registry when needed. All I/O a
///  stream does goes through the connection that is passed in by the connection's own service
///  and dispatch code.
pub struct Stream {
    lsid: u16,
    parent_lsid: u16,
    local_port: u16,
    remote_port: u16,
    usid: Uuid,
    connection_end_point: EndPoint,
    registry: Weak<Registry>,
    config: Arc<SstConfig>,

    control: Mutex<StreamControl>,
    receive: Mutex<ReceiveWindow>,
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream[{}@{:?}:{}->{}]", self.lsid, self.connection_end_point, self.local_port, self.remote_port)
    }
}

impl Stream {
    pub(crate) fn new(ids: StreamIds, origin: StreamOrigin, registry: Weak<Registry>, config: Arc<SstConfig>, now: Instant) -> Arc<Stream> {
        let mut receive = ReceiveWindow::new(config.max_receive_window);

        let control = match origin {
            StreamOrigin::Local { initial_data, callback } => {
                let num_initial = initial_data.len().min(config.max_payload_size);
                let mut send = SendQueue::new(&config, num_initial as u64);
                let num_written = send.write(&initial_data[num_initial..]);
                if num_initial + num_written < initial_data.len() {
                    warn!("initial data of stream {} exceeds the send queue - truncated to {} bytes", ids.lsid, num_initial + num_written);
                }

                StreamControl {
                    state: StreamState::PendingConnect,
                    remote_lsid: None,
                    init_attempts: 0,
                    last_init_time: None,
                    initial_data: initial_data.slice(..num_initial),
                    creation_callback: Some(callback),
                    last_activity: now,
                    send,
                }
            }
            StreamOrigin::Remote { remote_lsid } => {
                receive.touch(now);
                StreamControl {
                    state: StreamState::Connected,
                    remote_lsid: Some(remote_lsid),
                    init_attempts: 0,
                    last_init_time: None,
                    initial_data: Bytes::new(),
                    creation_callback: None,
                    last_activity: now,
                    send: SendQueue::new(&config, 0),
                }
            }
        };

        Arc::new(Stream {
            lsid: ids.lsid,
            parent_lsid: ids.parent_lsid,
            local_port: ids.local_port,
            remote_port: ids.remote_port,
            usid: Uuid::new_v4(),
            connection_end_point: ids.connection,
            registry,
            config,
            control: Mutex::new(control),
            receive: Mutex::new(receive),
        })
    }

    pub fn lsid(&self) -> u16 {
        self.lsid
    }

    /// the peer's LSID for this stream, known once the handshake completed
    pub fn remote_lsid(&self) -> Option<u16> {
        lock(&self.control).remote_lsid
    }

    pub fn parent_lsid(&self) -> u16 {
        self.parent_lsid
    }

    pub fn usid(&self) -> Uuid {
        self.usid
    }

    pub fn local_end_point(&self) -> EndPoint {
        self.connection_end_point.with_port(self.local_port)
    }

    pub fn remote_end_point(&self) -> Option<EndPoint> {
        self.connection()
            .map(|c| c.remote_end_point().with_port(self.remote_port))
    }

    pub fn state(&self) -> StreamState {
        lock(&self.control).state
    }

    pub fn rto(&self) -> Duration {
        lock(&self.control).send.rto()
    }

    pub fn transmit_window(&self) -> u64 {
        lock(&self.control).send.transmit_window()
    }

    pub fn outstanding_bytes(&self) -> u64 {
        lock(&self.control).send.outstanding_bytes()
    }

    /// the window the peer advertised most recently, in bytes
    pub fn advertised_window(&self) -> u64 {
        lock(&self.control).send.advertised_window()
    }

    pub fn queue_length(&self) -> usize {
        lock(&self.control).send.queue_length()
    }

    /// Queues data for sending, returning how much of it was queued. This is less than
    ///  `data.len()` if the send queue's budget is exhausted.
    pub fn write(&self, data: &[u8]) -> SstResult<usize> {
        let mut control = lock(&self.control);
        match control.state {
            StreamState::PendingConnect | StreamState::Connected => Ok(control.send.write(data)),
            StreamState::PendingDisconnect | StreamState::Disconnected => Err(SstError::StreamClosed),
        }
    }

    /// writes several buffers in order, stopping at the first one that does not fit completely
    pub fn writev(&self, buffers: &[&[u8]]) -> SstResult<usize> {
        let mut total = 0;
        for buffer in buffers {
            let num_written = self.write(buffer)?;
            total += num_written;
            if num_written < buffer.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Registers the callback that receives this stream's data, in order and without gaps. Data
    ///  that arrived before registration is delivered right away.
    ///
    /// The callback is invoked while the stream's receive state is locked, so it must not
    ///  register another read callback on the same stream.
    pub fn register_read_callback(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        lock(&self.receive).register_read_callback(Box::new(callback));
    }

    /// Opens a child stream on the same connection. `callback` is invoked with the outcome of
    ///  the handshake, or with the error if the stream cannot be opened at all.
    pub fn create_child_stream(&self, initial_data: &[u8], local_port: u16, remote_port: u16, callback: impl FnOnce(SstResult<Arc<Stream>>) + Send + 'static) -> SstResult<Arc<Stream>> {
        match self.connection() {
            Some(connection) => connection.open_stream(self.lsid, initial_data, local_port, remote_port, callback),
            None => {
                let error = SstError::UnknownConnection(self.connection_end_point);
                callback(Err(error.clone()));
                Err(error)
            }
        }
    }

    /// accept child streams the peer opens towards `port`
    pub fn listen_substream(&self, port: u16, listener: impl Fn(Arc<Stream>) + Send + Sync + 'static) -> SstResult<()> {
        let listener: StreamListener = Arc::new(listener);
        self.connection()
            .ok_or(SstError::UnknownConnection(self.connection_end_point))?
            .install_stream_listener(port, listener)
    }

    pub fn unlisten_substream(&self, port: u16) {
        if let Some(connection) = self.connection() {
            connection.unlisten_stream(port);
        }
    }

    /// sends an unreliable datagram over this stream's connection
    pub fn datagram(&self, data: &[u8], local_port: u16, remote_port: u16, callback: impl FnOnce(SstResult<()>, Bytes) + Send + 'static) {
        match self.connection() {
            Some(connection) => connection.send_datagram(data, local_port, remote_port, callback),
            None => {
                let callback: DatagramSentCallback = Box::new(callback);
                callback(Err(SstError::UnknownConnection(self.connection_end_point)), Bytes::copy_from_slice(data))
            }
        }
    }

    /// `force=false` lets the stream send everything queued and wait for it to be acknowledged
    ///  before it disconnects. `force=true` disconnects right away, discarding all data.
    ///
    /// Neither sends anything to the peer.
    pub fn close(&self, force: bool) {
        if !force {
            let mut control = lock(&self.control);
            match control.state {
                StreamState::Connected => {
                    debug!("{:?}: closing gracefully", self);
                    control.state = StreamState::PendingDisconnect;
                    return;
                }
                StreamState::PendingConnect => {}
                StreamState::PendingDisconnect | StreamState::Disconnected => return,
            }
        }

        debug!("{:?}: closing", self);
        let (callback, remote_lsid) = self.abort();
        if let Some(connection) = self.connection() {
            connection.erase_stream(self.lsid, remote_lsid);
        }
        if let Some(callback) = callback {
            callback(Err(SstError::StreamClosed));
        }
    }

    /// the connection this stream is multiplexed over, unless it was closed
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.registry.upgrade()?
            .connection(&self.connection_end_point)
    }

    /// Transitions to Disconnected, dropping all data. This does not touch the connection, and
    ///  returns the pending creation callback for the caller to invoke.
    pub(crate) fn abort(&self) -> (Option<StreamCallback>, Option<u16>) {
        let mut control = lock(&self.control);
        control.state = StreamState::Disconnected;
        control.send.clear();
        (control.creation_callback.take(), control.remote_lsid)
    }

    fn header(&self, kind: StreamPacketKind, window: u8) -> StreamHeader {
        StreamHeader {
            lsid: self.lsid,
            flags: 0,
            window,
            src_port: self.local_port,
            dest_port: self.remote_port,
            kind,
        }
    }

    fn window_exponent(&self) -> u8 {
        lock(&self.receive).window_exponent()
    }

    pub(crate) fn service(self: &Arc<Self>, now: Instant, connection: &Connection, outbox: &mut Outbox) -> StreamTick {
        let (last_receive_time, window) = {
            let receive = lock(&self.receive);
            (receive.last_receive_time(), receive.window_exponent())
        };

        if last_receive_time.is_some_and(|t| now.saturating_duration_since(t) >= self.config.stream_inactivity_timeout) {
            info!("{:?}: nothing received for {:?} - closing", self, self.config.stream_inactivity_timeout);
            if let (Some(callback), _) = self.abort() {
                outbox.defer(move || callback(Err(SstError::StreamClosed)));
            }
            return StreamTick::Disconnected;
        }

        let mut control = lock(&self.control);
        match control.state {
            StreamState::Disconnected => StreamTick::Disconnected,
            StreamState::PendingConnect => self.service_handshake(&mut control, now, window, connection, outbox),
            StreamState::Connected | StreamState::PendingDisconnect => self.service_connected(&mut control, now, window, connection, outbox),
        }
    }

    fn service_handshake(&self, control: &mut StreamControl, now: Instant, window: u8, connection: &Connection, outbox: &mut Outbox) -> StreamTick {
        let is_due = control.last_init_time
            .map_or(true, |t| now.saturating_duration_since(t) >= control.send.rto() * 2);
        if !is_due {
            return StreamTick::Alive;
        }

        if control.init_attempts >= self.config.max_init_retransmissions {
            error!("{:?}: no reply after {} init packets - giving up", self, control.init_attempts);
            control.state = StreamState::Disconnected;
            control.send.clear();
            if let Some(callback) = control.creation_callback.take() {
                outbox.defer(move || callback(Err(SstError::StreamConnectFailed)));
            }
            return if self.parent_lsid == 0 {
                StreamTick::RootConnectFailed
            }
            else {
                StreamTick::Disconnected
            };
        }

        control.init_attempts += 1;
        control.last_init_time = Some(now);
        control.last_activity = now;

        trace!("{:?}: sending init #{}", self, control.init_attempts);
        let header = self.header(StreamPacketKind::Init { parent_lsid: self.parent_lsid, byte_sequence_number: 0 }, window);
        connection.enqueue_segment(header.to_bytes(&control.initial_data));
        StreamTick::Alive
    }

    fn service_connected(&self, control: &mut StreamControl, now: Instant, window: u8, connection: &Connection, outbox: &mut Outbox) -> StreamTick {
        if control.send.is_resend_due(now) {
            control.send.resend_unacked(now);
        }

        if control.state == StreamState::PendingDisconnect && control.send.is_drained() {
            debug!("{:?}: all data acknowledged - disconnected", self);
            control.state = StreamState::Disconnected;
            return StreamTick::Disconnected;
        }

        let num_sent = control.send.drain(now, |buffer| {
            let header = self.header(StreamPacketKind::Data { byte_sequence_number: buffer.offset }, window);
            connection.enqueue_segment(header.to_bytes(&buffer.data))
        });

        if num_sent > 0 {
            control.last_activity = now;
        }
        else if control.state == StreamState::Connected && now.saturating_duration_since(control.last_activity) >= self.config.keep_alive_interval {
            trace!("{:?}: sending keep-alive", self);
            control.last_activity = now;
            // acknowledges no channel segment: sequence number 0 is never used
            connection.send_ack_segment(&self.header(StreamPacketKind::Ack, window).to_bytes(&[]), 0, outbox);
        }
        StreamTick::Alive
    }

    /// (re)sends the Reply to the peer's Init
    pub(crate) fn send_reply(&self, connection: &Connection) {
        let Some(remote_lsid) = self.remote_lsid() else {
            return;
        };
        let header = self.header(StreamPacketKind::Reply { reply_to_lsid: remote_lsid }, self.window_exponent());
        connection.enqueue_segment(header.to_bytes(&[]));
    }

    /// Completes the handshake of a locally opened stream. Returns false if the stream was not
    ///  waiting for a reply, in which case nothing changes.
    pub(crate) fn on_reply(self: &Arc<Self>, remote_lsid: u16, window: u8, now: Instant, outbox: &mut Outbox) -> Result<bool, ProtocolError> {
        let (callback, window_result) = {
            let mut control = lock(&self.control);
            if control.state != StreamState::PendingConnect {
                return Ok(false);
            }
            control.state = StreamState::Connected;
            control.remote_lsid = Some(remote_lsid);
            control.initial_data = Bytes::new();
            (control.creation_callback.take(), control.send.update_window(window))
        };
        lock(&self.receive).touch(now);

        debug!("{:?}: connected, remote lsid is {}", self, remote_lsid);
        if let Some(callback) = callback {
            let stream = self.clone();
            outbox.defer(move || callback(Ok(stream)));
        }
        window_result.map(|_| true)
    }

    /// Handles stream data (from a Data or Init packet) that arrived in the channel segment
    ///  `segment_sequence_number`, acknowledging it if it was accepted.
    pub(crate) fn on_data(&self, connection: &Connection, segment_sequence_number: u64, offset: u64, data: &[u8], window: u8, now: Instant, outbox: &mut Outbox) -> Result<(), ProtocolError> {
        let window_result = {
            let mut control = lock(&self.control);
            if control.state == StreamState::Disconnected {
                return Ok(());
            }
            control.send.update_window(window)
        };

        let (disposition, own_window) = {
            let mut receive = lock(&self.receive);
            receive.touch(now);
            let disposition = receive.receive(offset, data);
            (disposition, receive.window_exponent())
        };

        if disposition == ReceiveDisposition::Ack {
            let header = self.header(StreamPacketKind::Ack, own_window);
            connection.send_ack_segment(&header.to_bytes(&[]), segment_sequence_number, outbox);
        }
        window_result
    }

    pub(crate) fn on_ack(&self, ack_sequence_number: u64, window: u8, now: Instant) -> Result<(), ProtocolError> {
        lock(&self.receive).touch(now);

        let mut control = lock(&self.control);
        if control.state == StreamState::Disconnected {
            return Ok(());
        }
        if control.send.on_ack(ack_sequence_number, window, now)? {
            trace!("{:?}: channel segment #{} acknowledged, {} bytes outstanding", self, ack_sequence_number, control.send.outstanding_bytes());
        }
        Ok(())
    }
}
