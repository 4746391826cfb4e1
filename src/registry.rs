use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::callbacks::{ConnectCallback, StreamListener};
use crate::channel_header::{ChannelHeader, ChannelNegotiation};
use crate::channel_ids::ChannelIdAllocator;
use crate::config::SstConfig;
use crate::connection::{Connection, ConnectionTick, PacketOutcome};
use crate::datagram_layer::{DatagramLayer, DatagramRecipient};
use crate::end_point::EndPoint;
use crate::error::{ProtocolError, SstError, SstResult};
use crate::outbox::Outbox;
use crate::stream::Stream;
use crate::util::lock;

struct RegistryState {
    connections: BTreeMap<EndPoint, Arc<Connection>>,
    /// end points accepting channel-0 requests, with the listener for the root streams of
    ///  connections accepted there
    listeners: BTreeMap<EndPoint, StreamListener>,
    pending_connects: BTreeMap<EndPoint, ConnectCallback>,
    /// (peer end point, peer channel ID) of every accepted request -> local end point of the
    ///  connection created for it, for recognizing retransmitted requests
    accepted: BTreeMap<(EndPoint, u16), EndPoint>,
    channel_ids: ChannelIdAllocator,
}

/// The directory of all connections and listeners sharing a datagram layer.
///
/// All protocol work happens in two entry points: [Registry::service], which must be called
///  periodically (see [crate::poller::Poller]), and [Registry::on_datagram] for every arriving
///  payload. Both collect packets and callbacks while holding locks and send / invoke them
///  afterwards.
pub struct Registry {
    config: Arc<SstConfig>,
    datagram_layer: Arc<dyn DatagramLayer>,
    self_ref: Weak<Registry>,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(config: SstConfig, datagram_layer: Arc<dyn DatagramLayer>) -> anyhow::Result<Arc<Registry>> {
        config.validate()?;

        Ok(Arc::new_cyclic(|self_ref| Registry {
            config: Arc::new(config),
            datagram_layer,
            self_ref: self_ref.clone(),
            state: Mutex::new(RegistryState {
                connections: BTreeMap::new(),
                listeners: BTreeMap::new(),
                pending_connects: BTreeMap::new(),
                accepted: BTreeMap::new(),
                channel_ids: ChannelIdAllocator::new(),
            }),
        }))
    }

    pub fn config(&self) -> &SstConfig {
        &self.config
    }

    fn recipient(&self) -> Arc<dyn DatagramRecipient> {
        Arc::new(RegistryRecipient { registry: self.self_ref.clone() })
    }

    /// Starts connecting `local` to the listener at `remote`. `on_connected` is called when the
    ///  channel is established, or with [SstError::ConnectTimeout] when the peer does not reply.
    ///  `on_stream` accepts streams the peer opens towards `local`'s port.
    ///
    /// Fails synchronously (without calling `on_connected`) if `local` is already bound or there
    ///  is no channel ID left.
    pub async fn connect(&self, local: EndPoint, remote: EndPoint, on_connected: impl FnOnce(SstResult<Arc<Connection>>) + Send + 'static, on_stream: Option<StreamListener>) -> SstResult<()> {
        let connection = {
            let mut state = lock(&self.state);
            if state.connections.contains_key(&local) || state.listeners.contains_key(&local) {
                return Err(SstError::EndPointInUse(local));
            }

            let channel_id = state.channel_ids.allocate(|_| true)?;
            let connection = Connection::new_connecting(local, remote, channel_id, on_stream, self.config.clone(), self.self_ref.clone());
            state.connections.insert(local, connection.clone());
            state.pending_connects.insert(local, Box::new(on_connected));
            connection
        };

        info!("connecting {:?} to {:?}", local, remote);
        self.datagram_layer.register_recipient(local, self.recipient());

        let mut outbox = Outbox::new();
        if connection.service(Instant::now(), &mut outbox) != ConnectionTick::Alive {
            outbox.append(self.discard_connection(&connection, SstError::ConnectionClosed));
        }
        outbox.flush(self.datagram_layer.as_ref()).await;
        Ok(())
    }

    /// Connects, then opens the root stream on the new connection. All failures are reported
    ///  through `on_stream`.
    pub async fn connect_stream(&self, local: EndPoint, remote: EndPoint, on_stream: impl FnOnce(SstResult<Arc<Stream>>) + Send + 'static) {
        let on_stream = Arc::new(Mutex::new(Some(on_stream)));
        let on_stream_for_connect = on_stream.clone();

        let on_connected = move |result: SstResult<Arc<Connection>>| {
            let Some(on_stream) = lock(&on_stream_for_connect).take() else {
                return;
            };
            match result {
                Ok(connection) => {
                    let remote_port = connection.remote_end_point().port;
                    let local_port = connection.local_end_point().port;
                    // failures are reported to the callback by open_stream itself
                    let _ = connection.open_stream(0, &[], local_port, remote_port, on_stream);
                }
                Err(e) => on_stream(Err(e)),
            }
        };

        if let Err(e) = self.connect(local, remote, on_connected, None).await {
            let on_stream = lock(&on_stream).take();
            if let Some(on_stream) = on_stream {
                on_stream(Err(e));
            }
        }
    }

    /// Accepts connections at `local`. `on_new_stream` is called for the root stream of every
    ///  accepted connection.
    pub fn listen(&self, local: EndPoint, on_new_stream: impl Fn(Arc<Stream>) + Send + Sync + 'static) -> SstResult<()> {
        {
            let mut state = lock(&self.state);
            if state.listeners.contains_key(&local) {
                return Err(SstError::ListenerExists(local));
            }
            if state.connections.contains_key(&local) {
                return Err(SstError::EndPointInUse(local));
            }
            state.listeners.insert(local, Arc::new(on_new_stream));
        }

        info!("listening on {:?}", local);
        self.datagram_layer.register_recipient(local, self.recipient());
        Ok(())
    }

    /// Stops accepting connections at `local`. Connections accepted there are not affected.
    pub fn unlisten(&self, local: &EndPoint) {
        if lock(&self.state).listeners.remove(local).is_some() {
            info!("no longer listening on {:?}", local);
            self.datagram_layer.unregister_recipient(*local);
        }
    }

    pub fn connection(&self, local: &EndPoint) -> Option<Arc<Connection>> {
        lock(&self.state).connections.get(local).cloned()
    }

    pub fn num_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Removes a connection from the registry and shuts it down. The returned outbox contains
    ///  the callbacks that must be notified: the pending connect callback receives
    ///  `connect_error`, pending stream callbacks [SstError::ConnectionClosed].
    pub(crate) fn discard_connection(&self, connection: &Connection, connect_error: SstError) -> Outbox {
        let local = connection.local_end_point();

        let (removed, connect_callback) = {
            let mut state = lock(&self.state);
            let is_registered = state.connections.get(&local)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection));

            if is_registered {
                state.connections.remove(&local);
                state.channel_ids.release(connection.local_channel_id());
                state.accepted.retain(|_, l| *l != local);
                (true, state.pending_connects.remove(&local))
            }
            else {
                (false, None)
            }
        };

        if removed {
            info!("discarding connection {:?}", connection);
            self.datagram_layer.unregister_recipient(local);
        }

        let mut outbox = Outbox::new();
        for callback in connection.shut_down() {
            outbox.defer(move || callback(Err(SstError::ConnectionClosed)));
        }
        if let Some(callback) = connect_callback {
            outbox.defer(move || callback(Err(connect_error)));
        }
        outbox
    }

    /// Force-closes all connections
    pub fn close_connections(&self) {
        let connections: Vec<Arc<Connection>> = lock(&self.state).connections.values().cloned().collect();
        for connection in connections {
            self.discard_connection(&connection, SstError::ConnectionClosed)
                .run_callbacks();
        }
    }

    /// Does one round of periodic protocol work for all connections: timers, retransmission
    ///  and sending queued segments.
    pub async fn service(&self) {
        let outbox = self.service_at(Instant::now());
        outbox.flush(self.datagram_layer.as_ref()).await;
    }

    pub(crate) fn service_at(&self, now: Instant) -> Outbox {
        let connections: Vec<Arc<Connection>> = lock(&self.state).connections.values().cloned().collect();

        let mut outbox = Outbox::new();
        for connection in connections {
            match connection.service(now, &mut outbox) {
                ConnectionTick::Alive => {}
                ConnectionTick::Closed => {
                    outbox.append(self.discard_connection(&connection, SstError::ConnectionClosed));
                }
                ConnectionTick::ConnectTimedOut => {
                    let remote = connection.remote_end_point();
                    error!("connect from {:?} to {:?} timed out", connection.local_end_point(), remote);
                    outbox.append(self.discard_connection(&connection, SstError::ConnectTimeout(remote)));
                }
            }
        }
        outbox
    }

    /// Dispatches a payload that arrived from `from` for `to`
    pub async fn on_datagram(&self, from: EndPoint, to: EndPoint, packet: Bytes) {
        let outbox = self.handle_datagram(from, to, packet, Instant::now());
        outbox.flush(self.datagram_layer.as_ref()).await;
    }

    pub(crate) fn handle_datagram(&self, from: EndPoint, to: EndPoint, packet: Bytes, now: Instant) -> Outbox {
        let span = debug_span!("datagram", %from, %to);
        let _entered = span.enter();

        let mut outbox = Outbox::new();

        let (header, payload) = match ChannelHeader::parse_packet(packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping malformed packet: {}", e);
                return outbox;
            }
        };
        trace!("received {:?}", header);

        let Some(connection) = self.connection(&to) else {
            if header.channel_id == ChannelHeader::NEW_CHANNEL_REQUEST {
                self.accept(from, to, payload, &mut outbox);
            }
            else {
                debug!("no connection at {:?} - dropping packet", to);
            }
            return outbox;
        };

        if header.channel_id == ChannelHeader::NEW_CHANNEL_REQUEST {
            info!("{:?} is bound to a connection - ignoring channel-0 request", to);
            return outbox;
        }

        match connection.on_packet(header, payload, now, &mut outbox) {
            Ok(PacketOutcome::Handled) => {}
            Ok(PacketOutcome::NegotiationComplete) => {
                if let Some(callback) = lock(&self.state).pending_connects.remove(&to) {
                    let connection = connection.clone();
                    outbox.defer(move || callback(Ok(connection)));
                }
            }
            Err(SstError::Protocol(e @ ProtocolError::WindowUnderflow { .. })) => debug!("{:?}: {}", connection, e),
            Err(e) => warn!("{:?}: {}", connection, e),
        }
        outbox
    }

    fn accept(&self, from: EndPoint, to: EndPoint, payload: Bytes, outbox: &mut Outbox) {
        let request = match ChannelNegotiation::deser(&mut payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping malformed channel-0 request: {}", e);
                return;
            }
        };

        let connection = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            let existing = state.accepted.get(&(from, request.channel_id))
                .and_then(|local| state.connections.get(local))
                .cloned();
            if let Some(existing) = existing {
                drop(guard);
                debug!("retransmitted channel-0 request from {:?} - resending reply", from);
                existing.send_negotiation_reply(outbox);
                return;
            }

            let Some(listener) = state.listeners.get(&to).cloned() else {
                warn!("no one listening on {:?}", to);
                return;
            };

            let connections = &state.connections;
            let listeners = &state.listeners;
            let channel_id = match state.channel_ids.allocate(|id| {
                let end_point = to.with_port(id);
                !connections.contains_key(&end_point) && !listeners.contains_key(&end_point)
            }) {
                Ok(id) => id,
                Err(e) => {
                    warn!("cannot accept connection from {:?}: {}", from, e);
                    return;
                }
            };

            // the channel ID doubles as the port of the new connection
            let local = to.with_port(channel_id);
            let connection = Connection::new_accepted(local, from, channel_id, request.channel_id, listener, self.config.clone(), self.self_ref.clone());
            state.connections.insert(local, connection.clone());
            state.accepted.insert((from, request.channel_id), local);
            connection
        };

        info!("accepted connection from {:?} at {:?}", from, connection.local_end_point());
        self.datagram_layer.register_recipient(connection.local_end_point(), self.recipient());
        connection.send_negotiation_reply(outbox);
    }
}

/// Adapter that hands datagrams from the datagram layer to a registry without keeping it alive
struct RegistryRecipient {
    registry: Weak<Registry>,
}

#[async_trait]
impl DatagramRecipient for RegistryRecipient {
    async fn on_datagram(&self, from: EndPoint, to: EndPoint, packet: Bytes) {
        match self.registry.upgrade() {
            Some(registry) => registry.on_datagram(from, to, packet).await,
            None => trace!("registry is gone - dropping datagram for {:?}", to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::{always, eq};
    use crate::connection::ConnectionState;
    use crate::datagram_layer::MockDatagramLayer;
    use crate::loopback::Fate;
    use crate::stream::StreamState;
    use crate::test_util::{client_end_point, server_end_point, Slot, TestNet};

    fn request_packet(channel_id: u16) -> Bytes {
        ChannelHeader::new(ChannelHeader::NEW_CHANNEL_REQUEST, 1, 0)
            .to_packet(&ChannelNegotiation::request(channel_id).to_bytes())
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SstConfig {
            max_payload_size: 0,
            ..SstConfig::default()
        };
        assert!(Registry::new(config, Arc::new(MockDatagramLayer::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_point_in_use() {
        let net = TestNet::new();
        net.client.connect(client_end_point(), server_end_point(), |_| {}, None).await.unwrap();

        assert_eq!(net.client.connect(client_end_point(), server_end_point(), |_| {}, None).await,
                   Err(SstError::EndPointInUse(client_end_point())));
        assert_eq!(net.client.listen(client_end_point(), |_| {}),
                   Err(SstError::EndPointInUse(client_end_point())));
        assert_eq!(net.client.num_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen() {
        let net = TestNet::new();
        assert_eq!(net.server.listen(server_end_point(), |_| {}), Ok(()));
        assert_eq!(net.server.listen(server_end_point(), |_| {}), Err(SstError::ListenerExists(server_end_point())));
        assert_eq!(net.server.connect(server_end_point(), client_end_point(), |_| {}, None).await,
                   Err(SstError::EndPointInUse(server_end_point())));

        net.server.unlisten(&server_end_point());
        assert_eq!(net.server.listen(server_end_point(), |_| {}), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stream_reports_synchronous_failure() {
        let net = TestNet::new();
        net.client.connect(client_end_point(), server_end_point(), |_| {}, None).await.unwrap();

        let result = Slot::new();
        let cloned = result.clone();
        net.client.connect_stream(client_end_point(), server_end_point(), move |r| cloned.set(r.map(|s| s.lsid()))).await;
        assert_eq!(result.take(), Some(Err(SstError::EndPointInUse(client_end_point()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let net = TestNet::new();

        let result = Slot::new();
        let cloned = result.clone();
        net.client.connect(client_end_point(), server_end_point(), move |r| cloned.set(r.map(|c| c.local_channel_id())), None).await.unwrap();

        net.run_for(Duration::from_secs(50)).await;
        assert!(!result.is_set());
        assert_eq!(net.network.num_sent(), 5);

        net.run_for(Duration::from_secs(20)).await;
        assert_eq!(result.take(), Some(Err(SstError::ConnectTimeout(server_end_point()))));
        assert_eq!(net.network.num_sent(), 5);
        assert_eq!(net.client.num_connections(), 0);

        // the end point is free again
        assert_eq!(net.client.connect(client_end_point(), server_end_point(), |_| {}, None).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_reply_is_resent_for_retransmitted_request() {
        let net = TestNet::with_fault_injector(|n, _, _, _| if n == 1 { Fate::Drop } else { Fate::Deliver });
        net.server.listen(server_end_point(), |_| {}).unwrap();

        let connected = Slot::new();
        let cloned = connected.clone();
        net.client.connect(client_end_point(), server_end_point(), move |r| cloned.set(r.map(|c| c.remote_end_point())), None).await.unwrap();
        net.network.deliver_all().await;
        assert!(!connected.is_set());
        assert_eq!(net.server.num_connections(), 1);

        assert!(net.run_until(100, || connected.is_set()).await);
        assert_eq!(connected.take(), Some(Ok(server_end_point().with_port(65535))));
        assert_eq!(net.server.num_connections(), 1);
        assert_eq!(net.server.connection(&server_end_point().with_port(65535)).unwrap().state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let mut datagram_layer = MockDatagramLayer::new();
        datagram_layer.expect_register_recipient().never();
        let registry = Registry::new(SstConfig::default(), Arc::new(datagram_layer)).unwrap();

        let outbox = registry.handle_datagram(client_end_point(), server_end_point(), Bytes::from_static(&[1]), Instant::now());
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_request_without_listener_is_dropped() {
        let mut datagram_layer = MockDatagramLayer::new();
        datagram_layer.expect_register_recipient().never();
        let registry = Registry::new(SstConfig::default(), Arc::new(datagram_layer)).unwrap();

        let outbox = registry.handle_datagram(client_end_point(), server_end_point(), request_packet(17), Instant::now());
        assert!(outbox.is_empty());
        assert_eq!(registry.num_connections(), 0);
    }

    #[tokio::test]
    async fn test_accept_replies_with_new_channel() {
        let accepted_end_point = server_end_point().with_port(65535);

        let mut datagram_layer = MockDatagramLayer::new();
        datagram_layer.expect_register_recipient()
            .withf(|end_point, _| *end_point == server_end_point())
            .once()
            .return_const(());
        datagram_layer.expect_register_recipient()
            .withf(move |end_point, _| *end_point == accepted_end_point)
            .once()
            .return_const(());
        let registry = Registry::new(SstConfig::default(), Arc::new(datagram_layer)).unwrap();
        registry.listen(server_end_point(), |_| {}).unwrap();

        let outbox = registry.handle_datagram(client_end_point(), server_end_point(), request_packet(17), Instant::now());
        assert_eq!(outbox.packets().len(), 1);
        let reply = &outbox.packets()[0];
        assert_eq!(reply.from, accepted_end_point);
        assert_eq!(reply.to, client_end_point());

        let (header, mut payload) = ChannelHeader::parse_packet(reply.packet.clone()).unwrap();
        assert_eq!(header.channel_id, 17);
        assert_eq!(ChannelNegotiation::deser(&mut payload).unwrap(), ChannelNegotiation::reply(65535, 65535));

        // a retransmitted request gets the same reply, without a second connection
        let outbox = registry.handle_datagram(client_end_point(), server_end_point(), request_packet(17), Instant::now());
        assert_eq!(outbox.packets().len(), 1);
        assert_eq!(outbox.packets()[0].from, accepted_end_point);
        assert_eq!(registry.num_connections(), 1);
    }

    #[tokio::test]
    async fn test_channel_zero_request_to_connection_is_ignored() {
        let mut datagram_layer = MockDatagramLayer::new();
        datagram_layer.expect_register_recipient()
            .with(eq(client_end_point()), always())
            .return_const(());
        datagram_layer.expect_send()
            .return_const(());
        let registry = Registry::new(SstConfig::default(), Arc::new(datagram_layer)).unwrap();
        registry.connect(client_end_point(), server_end_point(), |_| {}, None).await.unwrap();

        let outbox = registry.handle_datagram(server_end_point(), client_end_point(), request_packet(17), Instant::now());
        assert!(outbox.is_empty());
        assert_eq!(registry.num_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_connections() {
        let net = TestNet::new();
        let (client_root, server_root) = net.connect_streams().await;

        net.client.close_connections();
        assert_eq!(net.client.num_connections(), 0);
        assert_eq!(client_root.state(), StreamState::Disconnected);
        assert!(client_root.connection().is_none());

        // the peer is not told and keeps its side until it times out
        assert_eq!(server_root.state(), StreamState::Connected);
        assert_eq!(net.server.num_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_registry_stops_dispatch() {
        let net = TestNet::new();
        net.server.listen(server_end_point(), |_| {}).unwrap();
        let TestNet { network, client, server } = net;
        drop(server);

        client.connect(client_end_point(), server_end_point(), |_| {}, None).await.unwrap();
        network.deliver_all().await;
        assert_eq!(client.connection(&client_end_point()).unwrap().state(), ConnectionState::PendingConnect);
    }
}
