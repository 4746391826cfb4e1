use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::select;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::registry::Registry;

/// Drives a [Registry] by calling [Registry::service] at the configured service interval. The
///  task stops when [Poller::stop] is called, when the poller is dropped, or when the registry
///  goes away.
pub struct Poller {
    handle: JoinHandle<()>,
    stop_sender: Option<oneshot::Sender<()>>,
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Poller {
    pub fn spawn(registry: &Arc<Registry>) -> Poller {
        let (stop_sender, stop_receiver) = oneshot::channel();
        let service_interval = registry.config().service_interval;

        Poller {
            handle: tokio::spawn(Self::do_loop(Arc::downgrade(registry), service_interval, stop_receiver)),
            stop_sender: Some(stop_sender),
        }
    }

    /// stops the polling task, returning after the current round of service is done
    pub async fn stop(mut self) {
        if let Some(stop_sender) = self.stop_sender.take() {
            let _ = stop_sender.send(());
        }
        let _ = (&mut self.handle).await;
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn do_loop(registry: Weak<Registry>, service_interval: Duration, mut stop_receiver: oneshot::Receiver<()>) {
        let mut service_interval = interval(service_interval);
        service_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = service_interval.tick() => {
                    let Some(registry) = registry.upgrade() else {
                        debug!("registry was dropped - stopping poller");
                        return;
                    };
                    registry.service().await;
                }
                _ = &mut stop_receiver => {
                    debug!("poller stopped");
                    return;
                }
            }
        }
    }
}
