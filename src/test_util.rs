use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::SstConfig;
use crate::datagram_layer::DatagramLayer;
use crate::end_point::EndPoint;
use crate::loopback::{Fate, LoopbackNetwork};
use crate::registry::Registry;
use crate::stream::Stream;

pub fn client_end_point() -> EndPoint {
    EndPoint::new(Uuid::from_u128(0xc11e47), 5)
}

pub fn server_end_point() -> EndPoint {
    EndPoint::new(Uuid::from_u128(0x5e4e4), 7)
}

/// A value set from inside a callback
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl <T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot(self.0.clone())
    }
}

impl <T> Slot<T> {
    pub fn new() -> Slot<T> {
        Slot(Arc::new(Mutex::new(None)))
    }

    pub fn set(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap().take()
    }
}

impl <T: Clone> Slot<T> {
    pub fn get(&self) -> Option<T> {
        self.0.lock().unwrap().clone()
    }
}

/// Collects the data delivered to a read callback
#[derive(Clone, Default)]
pub struct Collector(Arc<Mutex<Vec<u8>>>);

impl Collector {
    pub fn new() -> Collector {
        Collector::default()
    }

    pub fn callback(&self) -> impl FnMut(&[u8]) + Send + 'static {
        let data = self.0.clone();
        move |chunk| data.lock().unwrap().extend_from_slice(chunk)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn data(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A client and a server registry sharing a loopback network. Tests using this must run on a
///  runtime with paused time.
pub struct TestNet {
    pub network: Arc<LoopbackNetwork>,
    pub client: Arc<Registry>,
    pub server: Arc<Registry>,
}

impl TestNet {
    pub fn new() -> TestNet {
        TestNet::with_network(LoopbackNetwork::new(), SstConfig::default())
    }

    pub fn with_fault_injector(fault_injector: impl FnMut(u64, &EndPoint, &EndPoint, &[u8]) -> Fate + Send + 'static) -> TestNet {
        TestNet::with_network(LoopbackNetwork::with_fault_injector(fault_injector), SstConfig::default())
    }

    pub fn with_network(network: LoopbackNetwork, config: SstConfig) -> TestNet {
        let network = Arc::new(network);
        let datagram_layer: Arc<dyn DatagramLayer> = network.clone();
        TestNet {
            client: Registry::new(config.clone(), datagram_layer.clone()).unwrap(),
            server: Registry::new(config, datagram_layer).unwrap(),
            network,
        }
    }

    /// advances time by one service interval, services both registries and delivers all
    ///  packets
    pub async fn tick(&self) {
        tokio::time::advance(self.client.config().service_interval).await;
        self.client.service().await;
        self.server.service().await;
        self.network.deliver_all().await;
    }

    /// Ticks until `condition` holds, returning false if it does not within `max_ticks`
    pub async fn run_until(&self, max_ticks: usize, mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..max_ticks {
            if condition() {
                return true;
            }
            self.tick().await;
        }
        condition()
    }

    pub async fn run_for(&self, duration: Duration) {
        let num_ticks = duration.as_millis() / self.client.config().service_interval.as_millis();
        for _ in 0..num_ticks {
            self.tick().await;
        }
    }

    /// Has the server listen, connects the client and returns the root stream on both sides
    pub async fn connect_streams(&self) -> (Arc<Stream>, Arc<Stream>) {
        let server_stream = Slot::new();
        let cloned = server_stream.clone();
        self.server.listen(server_end_point(), move |stream| cloned.set(stream)).unwrap();

        let client_stream = Slot::new();
        let cloned = client_stream.clone();
        self.client.connect_stream(client_end_point(), server_end_point(), move |result| cloned.set(result.unwrap())).await;
        self.network.deliver_all().await;

        assert!(self.run_until(1000, || client_stream.is_set() && server_stream.is_set()).await);
        (client_stream.take().unwrap(), server_stream.take().unwrap())
    }
}
