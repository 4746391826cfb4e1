use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::callbacks::{DatagramListener, DatagramSentCallback, StreamCallback, StreamListener};
use crate::channel::Channel;
use crate::channel_header::{ChannelHeader, ChannelNegotiation};
use crate::config::SstConfig;
use crate::datagram_assembler::DatagramAssembler;
use crate::end_point::EndPoint;
use crate::error::{ProtocolError, SstError, SstResult};
use crate::outbox::Outbox;
use crate::registry::Registry;
use crate::stream::{Stream, StreamIds, StreamOrigin, StreamTick};
use crate::stream_header::{StreamHeader, StreamPacketKind};
use crate::util::lock;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// sent a channel-0 request, waiting for the reply
    PendingConnect,
    /// replied to a channel-0 request, waiting for the first packet on the new channel
    PendingReceiveConnect,
    Connected,
    /// closing gracefully, waiting for the channel to drain
    PendingDisconnect,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ConnectionTick {
    Alive,
    /// the connection is done and must be discarded
    Closed,
    ConnectTimedOut,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketOutcome {
    Handled,
    /// the packet was the reply to this side's channel-0 request
    NegotiationComplete,
}

struct ConnectionInner {
    state: ConnectionState,
    last_lsid: u16,

    /// all streams, by their local LSID
    outgoing: FxHashMap<u16, Arc<Stream>>,
    /// streams whose peer LSID is known, by the peer's LSID
    incoming: FxHashMap<u16, Arc<Stream>>,

    stream_listeners: FxHashMap<u16, StreamListener>,
    datagram_listeners: FxHashMap<u16, Vec<DatagramListener>>,
    datagram_assembler: DatagramAssembler,

    connect_attempts: u32,
    last_connect_attempt: Option<Instant>,
    /// since when this (connected) connection has had no streams
    idle_since: Option<Instant>,
}

/// One channel between a local and a remote end point, multiplexing any number of streams.
///
/// Connections are created and owned by a [Registry], either by [Registry::connect] or when a
///  channel-0 request arrives at a listening end point. Except for the accessors, everything
///  here is driven by the registry's service and dispatch: the registry calls into the
///  connection, the connection calls into its streams.
pub struct Connection {
    local_end_point: EndPoint,
    local_channel_id: u16,
    config: Arc<SstConfig>,
    registry: Weak<Registry>,

    inner: Mutex<ConnectionInner>,
    channel: Mutex<Channel>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection[{:?}#{}]", self.local_end_point, self.local_channel_id)
    }
}

impl Connection {
    fn new(local_end_point: EndPoint, remote_end_point: EndPoint, local_channel_id: u16, remote_channel_id: u16, state: ConnectionState, stream_listener: Option<StreamListener>, config: Arc<SstConfig>, registry: Weak<Registry>) -> Arc<Connection> {
        let mut stream_listeners = FxHashMap::default();
        if let Some(listener) = stream_listener {
            stream_listeners.insert(local_end_point.port, listener);
        }

        Arc::new(Connection {
            local_end_point,
            local_channel_id,
            inner: Mutex::new(ConnectionInner {
                state,
                last_lsid: 0,
                outgoing: FxHashMap::default(),
                incoming: FxHashMap::default(),
                stream_listeners,
                datagram_listeners: FxHashMap::default(),
                datagram_assembler: DatagramAssembler::new(config.max_partial_datagrams),
                connect_attempts: 0,
                last_connect_attempt: None,
                idle_since: None,
            }),
            channel: Mutex::new(Channel::new(&config, remote_end_point, remote_channel_id)),
            config,
            registry,
        })
    }

    /// a connection that will send channel-0 requests to `remote_end_point` until it gets a reply
    pub(crate) fn new_connecting(local_end_point: EndPoint, remote_end_point: EndPoint, local_channel_id: u16, stream_listener: Option<StreamListener>, config: Arc<SstConfig>, registry: Weak<Registry>) -> Arc<Connection> {
        Self::new(local_end_point, remote_end_point, local_channel_id, 0, ConnectionState::PendingConnect, stream_listener, config, registry)
    }

    /// a connection created for a channel-0 request the peer sent from `remote_channel_id`
    pub(crate) fn new_accepted(local_end_point: EndPoint, remote_end_point: EndPoint, local_channel_id: u16, remote_channel_id: u16, stream_listener: StreamListener, config: Arc<SstConfig>, registry: Weak<Registry>) -> Arc<Connection> {
        Self::new(local_end_point, remote_end_point, local_channel_id, remote_channel_id, ConnectionState::PendingReceiveConnect, Some(stream_listener), config, registry)
    }

    pub fn local_end_point(&self) -> EndPoint {
        self.local_end_point
    }

    /// This is the end point the peer's side of the channel is bound to. For the connecting side,
    ///  this changes from the listening end point to the accepted connection's end point when
    ///  negotiation completes.
    pub fn remote_end_point(&self) -> EndPoint {
        lock(&self.channel).remote_end_point
    }

    pub fn local_channel_id(&self) -> u16 {
        self.local_channel_id
    }

    pub fn remote_channel_id(&self) -> u16 {
        lock(&self.channel).remote_channel_id
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn cwnd(&self) -> u32 {
        lock(&self.channel).cwnd()
    }

    pub fn rto(&self) -> Duration {
        lock(&self.channel).rto()
    }

    pub fn num_streams(&self) -> usize {
        lock(&self.inner).outgoing.len()
    }

    /// LSIDs wrap around, skipping 0 and those of streams that are still alive
    fn next_lsid(inner: &mut ConnectionInner) -> SstResult<u16> {
        let mut candidate = inner.last_lsid;
        for _ in 0..=u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate != 0 && !inner.outgoing.contains_key(&candidate) {
                inner.last_lsid = candidate;
                return Ok(candidate);
            }
        }
        Err(SstError::LsidsExhausted)
    }

    fn is_open(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected | ConnectionState::PendingReceiveConnect)
    }

    /// Opens a stream as a child of `parent_lsid` (0 for a root stream). `callback` is called once
    ///  the peer replied, or with an error if the handshake failed or the stream could not be
    ///  opened at all.
    pub fn open_stream(&self, parent_lsid: u16, initial_data: &[u8], local_port: u16, remote_port: u16, callback: impl FnOnce(SstResult<Arc<Stream>>) + Send + 'static) -> SstResult<Arc<Stream>> {
        let lsid = {
            let mut inner = lock(&self.inner);
            if Self::is_open(inner.state) {
                Self::next_lsid(&mut inner)
            }
            else {
                Err(SstError::ConnectionClosed)
            }
        };
        let lsid = match lsid {
            Ok(lsid) => lsid,
            Err(e) => {
                debug!("{:?}: cannot open stream: {}", self, e);
                callback(Err(e.clone()));
                return Err(e);
            }
        };

        let ids = StreamIds {
            lsid,
            parent_lsid,
            local_port,
            remote_port,
            connection: self.local_end_point,
        };
        let origin = StreamOrigin::Local {
            initial_data: Bytes::copy_from_slice(initial_data),
            callback: Box::new(callback),
        };
        let stream = Stream::new(ids, origin, self.registry.clone(), self.config.clone(), Instant::now());

        debug!("{:?}: opening stream {} (parent {}), port {} -> {}", self, lsid, parent_lsid, local_port, remote_port);
        lock(&self.inner).outgoing.insert(lsid, stream.clone());
        Ok(stream)
    }

    /// Accept streams the peer opens towards `port`. There can be only one listener per port.
    pub fn listen_stream(&self, port: u16, listener: impl Fn(Arc<Stream>) + Send + Sync + 'static) -> SstResult<()> {
        self.install_stream_listener(port, Arc::new(listener))
    }

    pub(crate) fn install_stream_listener(&self, port: u16, listener: StreamListener) -> SstResult<()> {
        let mut inner = lock(&self.inner);
        if inner.stream_listeners.contains_key(&port) {
            return Err(SstError::ListenerExists(self.local_end_point.with_port(port)));
        }
        inner.stream_listeners.insert(port, listener);
        Ok(())
    }

    pub fn unlisten_stream(&self, port: u16) {
        lock(&self.inner).stream_listeners.remove(&port);
    }

    /// adds a listener for datagrams arriving at `port` - there can be several per port
    pub fn register_datagram_listener(&self, port: u16, listener: impl Fn(&[u8]) + Send + Sync + 'static) {
        lock(&self.inner).datagram_listeners
            .entry(port)
            .or_default()
            .push(Arc::new(listener));
    }

    /// removes all datagram listeners of `port`
    pub fn unregister_datagram_listener(&self, port: u16) {
        lock(&self.inner).datagram_listeners.remove(&port);
    }

    /// Sends `data` as an unreliable datagram, split into as many fragments as necessary. The
    ///  callback is invoked once all fragments are handed to the channel, which says nothing
    ///  about whether they arrive.
    pub fn send_datagram(&self, data: &[u8], local_port: u16, remote_port: u16, callback: impl FnOnce(SstResult<()>, Bytes) + Send + 'static) {
        let callback: DatagramSentCallback = Box::new(callback);
        let data = Bytes::copy_from_slice(data);

        let lsid = {
            let mut inner = lock(&self.inner);
            if Self::is_open(inner.state) {
                Self::next_lsid(&mut inner)
            }
            else {
                Err(SstError::ConnectionClosed)
            }
        };
        let lsid = match lsid {
            Ok(lsid) => lsid,
            Err(e) => return callback(Err(e), data),
        };

        let max_payload_size = self.config.max_payload_size;
        let num_fragments = data.len().div_ceil(max_payload_size).max(1);
        trace!("{:?}: sending datagram of {} bytes as {} fragments, lsid {}", self, data.len(), num_fragments, lsid);

        {
            let mut channel = lock(&self.channel);
            for i in 0..num_fragments {
                let start = i * max_payload_size;
                let end = (start + max_payload_size).min(data.len());
                let header = StreamHeader {
                    lsid,
                    flags: if i + 1 < num_fragments { StreamHeader::FLAG_CONTINUES } else { 0 },
                    window: 0,
                    src_port: local_port,
                    dest_port: remote_port,
                    kind: StreamPacketKind::Datagram { offset: start as u64 },
                };
                // a full channel queue is just another way of losing a datagram
                if channel.enqueue(header.to_bytes(&data[start..end])).is_none() {
                    debug!("{:?}: channel queue full - dropping datagram {} at fragment {} of {}", self, lsid, i + 1, num_fragments);
                    break;
                }
            }
        }

        callback(Ok(()), data);
    }

    /// `force=false` stops the streams and lets the channel send what it has queued before the
    ///  connection is closed. `force=true` closes right away, failing all streams.
    pub fn close(&self, force: bool) {
        if !force {
            let mut inner = lock(&self.inner);
            match inner.state {
                ConnectionState::Connected => {
                    info!("{:?}: closing gracefully", self);
                    inner.state = ConnectionState::PendingDisconnect;
                    return;
                }
                ConnectionState::PendingDisconnect | ConnectionState::Disconnected => return,
                ConnectionState::PendingConnect | ConnectionState::PendingReceiveConnect => {}
            }
        }

        info!("{:?}: closing", self);
        match self.registry.upgrade() {
            Some(registry) => registry.discard_connection(self, SstError::ConnectionClosed).run_callbacks(),
            None => {
                for callback in self.shut_down() {
                    callback(Err(SstError::ConnectionClosed));
                }
            }
        }
    }

    /// Disconnects the connection and all of its streams, returning the streams' pending
    ///  creation callbacks
    pub(crate) fn shut_down(&self) -> Vec<StreamCallback> {
        let streams: Vec<Arc<Stream>> = {
            let mut inner = lock(&self.inner);
            inner.state = ConnectionState::Disconnected;
            inner.incoming.clear();
            inner.outgoing.drain().map(|(_, s)| s).collect()
        };
        lock(&self.channel).clear();

        streams.iter()
            .filter_map(|s| s.abort().0)
            .collect()
    }

    /// Removes a stream from the stream maps, closing the connection if it was the last one
    pub(crate) fn erase_stream(&self, lsid: u16, remote_lsid: Option<u16>) {
        if self.remove_stream(lsid, remote_lsid) {
            info!("{:?}: last stream erased", self);
            self.close(true);
        }
    }

    /// returns true if there are no streams left
    fn remove_stream(&self, lsid: u16, remote_lsid: Option<u16>) -> bool {
        let mut inner = lock(&self.inner);
        let removed = inner.outgoing.remove(&lsid).is_some();
        if let Some(remote_lsid) = remote_lsid {
            inner.incoming.remove(&remote_lsid);
        }
        removed && inner.outgoing.is_empty()
    }

    pub(crate) fn enqueue_segment(&self, payload: Bytes) -> Option<u64> {
        lock(&self.channel).enqueue(payload)
    }

    /// sends a stream packet right away, acknowledging the channel segment `ack_sequence_number`
    pub(crate) fn send_ack_segment(&self, payload: &[u8], ack_sequence_number: u64, outbox: &mut Outbox) {
        let mut channel = lock(&self.channel);
        let remote_channel_id = channel.remote_channel_id;
        channel.send_immediately(self.local_end_point, remote_channel_id, ack_sequence_number, payload, outbox);
    }

    /// (re)sends the reply to the peer's channel-0 request, as long as the peer has not started
    ///  using the channel
    pub(crate) fn send_negotiation_reply(&self, outbox: &mut Outbox) {
        if lock(&self.inner).state != ConnectionState::PendingReceiveConnect {
            return;
        }
        let reply = ChannelNegotiation::reply(self.local_channel_id, self.local_end_point.port);
        let mut channel = lock(&self.channel);
        let remote_channel_id = channel.remote_channel_id;
        trace!("{:?}: sending channel-0 reply to {:?}", self, channel.remote_end_point);
        channel.send_immediately(self.local_end_point, remote_channel_id, 0, &reply.to_bytes(), outbox);
    }

    pub(crate) fn service(&self, now: Instant, outbox: &mut Outbox) -> ConnectionTick {
        let state = lock(&self.inner).state;
        match state {
            ConnectionState::Disconnected => ConnectionTick::Closed,
            ConnectionState::PendingConnect => self.service_negotiation(now, outbox),
            ConnectionState::PendingDisconnect => {
                let mut channel = lock(&self.channel);
                if channel.is_idle() {
                    debug!("{:?}: channel drained", self);
                    return ConnectionTick::Closed;
                }
                channel.service(self.local_end_point, now, outbox);
                ConnectionTick::Alive
            }
            ConnectionState::PendingReceiveConnect | ConnectionState::Connected => {
                let tick = self.service_streams(now, outbox);
                if tick == ConnectionTick::Alive {
                    lock(&self.channel).service(self.local_end_point, now, outbox);
                }
                tick
            }
        }
    }

    fn service_negotiation(&self, now: Instant, outbox: &mut Outbox) -> ConnectionTick {
        let mut inner = lock(&self.inner);

        if let Some(last_attempt) = inner.last_connect_attempt {
            let backoff = self.config.initial_rto.saturating_mul(1 << (inner.connect_attempts - 1).min(16));
            if now.saturating_duration_since(last_attempt) < backoff {
                return ConnectionTick::Alive;
            }
        }

        if inner.connect_attempts >= self.config.max_connect_attempts {
            warn!("{:?}: no reply after {} channel-0 requests", self, inner.connect_attempts);
            inner.state = ConnectionState::Disconnected;
            return ConnectionTick::ConnectTimedOut;
        }

        inner.connect_attempts += 1;
        inner.last_connect_attempt = Some(now);

        let request = ChannelNegotiation::request(self.local_channel_id);
        let mut channel = lock(&self.channel);
        debug!("{:?}: sending channel-0 request #{} to {:?}", self, inner.connect_attempts, channel.remote_end_point);
        channel.send_immediately(self.local_end_point, ChannelHeader::NEW_CHANNEL_REQUEST, 0, &request.to_bytes(), outbox);
        ConnectionTick::Alive
    }

    fn service_streams(&self, now: Instant, outbox: &mut Outbox) -> ConnectionTick {
        let streams: Vec<Arc<Stream>> = lock(&self.inner).outgoing.values().cloned().collect();

        let mut finished = Vec::new();
        for stream in streams {
            match stream.service(now, self, outbox) {
                StreamTick::Alive => {}
                StreamTick::Disconnected => finished.push(stream),
                StreamTick::RootConnectFailed => {
                    warn!("{:?}: root stream {} failed to connect - closing connection", self, stream.lsid());
                    return ConnectionTick::Closed;
                }
            }
        }

        let mut no_streams_left = false;
        for stream in &finished {
            trace!("{:?}: erasing stream {}", self, stream.lsid());
            no_streams_left = self.remove_stream(stream.lsid(), stream.remote_lsid());
        }
        if no_streams_left {
            info!("{:?}: last stream erased", self);
            return ConnectionTick::Closed;
        }

        let mut inner = lock(&self.inner);
        if !inner.outgoing.is_empty() {
            inner.idle_since = None;
            return ConnectionTick::Alive;
        }
        let idle_since = *inner.idle_since.get_or_insert(now);
        if now.saturating_duration_since(idle_since) >= self.config.connection_idle_timeout {
            info!("{:?}: no streams for {:?} - closing", self, self.config.connection_idle_timeout);
            return ConnectionTick::Closed;
        }
        ConnectionTick::Alive
    }

    /// Handles a packet that arrived on this connection's channel. Malformed stream packets are
    ///  logged and dropped, protocol errors are returned to the caller after the packet was
    ///  processed as far as possible.
    pub(crate) fn on_packet(&self, header: ChannelHeader, payload: Bytes, now: Instant, outbox: &mut Outbox) -> SstResult<PacketOutcome> {
        if header.channel_id != self.local_channel_id {
            return Err(ProtocolError::UnexpectedChannel { expected: self.local_channel_id, actual: header.channel_id }.into());
        }

        {
            let mut inner = lock(&self.inner);
            let mut channel = lock(&self.channel);
            channel.on_received(&header, now);

            match inner.state {
                ConnectionState::Disconnected => return Ok(PacketOutcome::Handled),
                ConnectionState::PendingConnect => {
                    let reply = ChannelNegotiation::deser(&mut payload.clone())
                        .map_err(|_| ProtocolError::MalformedNegotiation)?;
                    let port = reply.port.ok_or(ProtocolError::MalformedNegotiation)?;

                    inner.state = ConnectionState::Connected;
                    channel.remote_channel_id = reply.channel_id;
                    channel.remote_end_point = channel.remote_end_point.with_port(port);
                    info!("{:?}: connected to {:?}, remote channel {}", self, channel.remote_end_point, reply.channel_id);

                    let remote_channel_id = channel.remote_channel_id;
                    channel.send_immediately(self.local_end_point, remote_channel_id, header.transmit_sequence_number, &[], outbox);
                    return Ok(PacketOutcome::NegotiationComplete);
                }
                ConnectionState::PendingReceiveConnect => {
                    info!("{:?}: connected to {:?}", self, channel.remote_end_point);
                    inner.state = ConnectionState::Connected;
                }
                ConnectionState::Connected | ConnectionState::PendingDisconnect => {}
            }
        }

        if payload.is_empty() {
            return Ok(PacketOutcome::Handled);
        }

        let (stream_header, stream_payload) = match StreamHeader::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{:?}: dropping malformed stream packet: {}", self, e);
                return Ok(PacketOutcome::Handled);
            }
        };
        trace!("{:?}: received {:?}", self, stream_header);

        match stream_header.kind {
            StreamPacketKind::Init { parent_lsid, byte_sequence_number } => self.on_init(&header, &stream_header, parent_lsid, byte_sequence_number, &stream_payload, now, outbox)?,
            StreamPacketKind::Reply { reply_to_lsid } => self.on_reply(&stream_header, reply_to_lsid, now, outbox)?,
            StreamPacketKind::Data { byte_sequence_number } => {
                if let Some(stream) = self.incoming_stream(stream_header.lsid) {
                    stream.on_data(self, header.transmit_sequence_number, byte_sequence_number, &stream_payload, stream_header.window, now, outbox)?;
                }
                else {
                    debug!("{:?}: data for unknown stream {}", self, stream_header.lsid);
                }
            }
            StreamPacketKind::Ack => {
                if let Some(stream) = self.incoming_stream(stream_header.lsid) {
                    stream.on_ack(header.ack_sequence_number, stream_header.window, now)?;
                }
                else {
                    debug!("{:?}: ack for unknown stream {}", self, stream_header.lsid);
                }
            }
            StreamPacketKind::Datagram { offset } => self.on_datagram(&header, &stream_header, offset, &stream_payload, outbox),
        }
        Ok(PacketOutcome::Handled)
    }

    fn incoming_stream(&self, remote_lsid: u16) -> Option<Arc<Stream>> {
        lock(&self.inner).incoming.get(&remote_lsid).cloned()
    }

    #[allow(clippy::too_many_arguments)]
    fn on_init(&self, header: &ChannelHeader, stream_header: &StreamHeader, parent_lsid: u16, byte_sequence_number: u64, payload: &[u8], now: Instant, outbox: &mut Outbox) -> SstResult<()> {
        let (stream, listener) = {
            let mut inner = lock(&self.inner);
            if let Some(existing) = inner.incoming.get(&stream_header.lsid).cloned() {
                drop(inner);
                trace!("{:?}: duplicate init for stream {} - resending reply", self, existing.lsid());
                existing.send_reply(self);
                return Ok(());
            }

            let Some(listener) = inner.stream_listeners.get(&stream_header.dest_port).cloned() else {
                warn!("{:?}: not listening for streams on port {}", self, stream_header.dest_port);
                return Ok(());
            };

            let ids = StreamIds {
                lsid: Self::next_lsid(&mut inner)?,
                parent_lsid,
                local_port: stream_header.dest_port,
                remote_port: stream_header.src_port,
                connection: self.local_end_point,
            };
            let stream = Stream::new(ids, StreamOrigin::Remote { remote_lsid: stream_header.lsid }, self.registry.clone(), self.config.clone(), now);
            inner.outgoing.insert(stream.lsid(), stream.clone());
            inner.incoming.insert(stream_header.lsid, stream.clone());
            (stream, listener)
        };

        debug!("{:?}: accepted stream {} (remote lsid {}) on port {}", self, stream.lsid(), stream_header.lsid, stream_header.dest_port);
        stream.send_reply(self);

        let accepted = stream.clone();
        outbox.defer(move || listener(accepted));

        stream.on_data(self, header.transmit_sequence_number, byte_sequence_number, payload, stream_header.window, now, outbox)?;
        Ok(())
    }

    fn on_reply(&self, stream_header: &StreamHeader, reply_to_lsid: u16, now: Instant, outbox: &mut Outbox) -> SstResult<()> {
        let stream = {
            let mut inner = lock(&self.inner);
            if inner.incoming.contains_key(&stream_header.lsid) {
                trace!("{:?}: duplicate reply for stream {}", self, reply_to_lsid);
                return Ok(());
            }
            let Some(stream) = inner.outgoing.get(&reply_to_lsid).cloned() else {
                debug!("{:?}: reply for unknown stream {}", self, reply_to_lsid);
                return Ok(());
            };
            inner.incoming.insert(stream_header.lsid, stream.clone());
            stream
        };

        stream.on_reply(stream_header.lsid, stream_header.window, now, outbox)?;
        Ok(())
    }

    fn on_datagram(&self, header: &ChannelHeader, stream_header: &StreamHeader, offset: u64, payload: &[u8], outbox: &mut Outbox) {
        self.send_ack_segment(&[], header.transmit_sequence_number, outbox);

        let (datagram, listeners) = {
            let mut inner = lock(&self.inner);
            let Some(datagram) = inner.datagram_assembler.on_fragment(stream_header.lsid, offset, stream_header.continues(), payload) else {
                return;
            };
            (datagram, inner.datagram_listeners.get(&stream_header.dest_port).cloned().unwrap_or_default())
        };

        if listeners.is_empty() {
            debug!("{:?}: no listener for datagram on port {} - dropping", self, stream_header.dest_port);
            return;
        }

        trace!("{:?}: received datagram of {} bytes for port {}", self, datagram.len(), stream_header.dest_port);
        outbox.defer(move || {
            for listener in listeners {
                listener(&datagram);
            }
        });
    }
}
