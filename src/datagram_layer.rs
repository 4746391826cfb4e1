use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::end_point::EndPoint;

/// The unreliable, message oriented substrate SST runs on. It delivers opaque payloads between
///  end points, without any guarantees regarding delivery, ordering or duplication.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramLayer: Send + Sync + 'static {
    /// fire and forget
    async fn send(&self, from: EndPoint, to: EndPoint, packet: Bytes);

    /// Payloads arriving for `end_point` are handed to `recipient` from then on, replacing any
    ///  previously registered recipient for the same end point.
    fn register_recipient(&self, end_point: EndPoint, recipient: Arc<dyn DatagramRecipient>);

    fn unregister_recipient(&self, end_point: EndPoint);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramRecipient: Send + Sync + 'static {
    /// called once per arriving payload; may be called concurrently from several contexts
    async fn on_datagram(&self, from: EndPoint, to: EndPoint, packet: Bytes);
}
