//! Fan-out of "new audio" events to subscribed connections.
//!
//! [`Dispatcher::broadcast`] is the synchronous core: snapshot the
//! subscribers, try each one independently, then evict every connection the
//! frame could not be handed to. [`ArtifactNotifier`] is the handle the upload
//! path holds; it queues events for a worker task owned by the server, so a
//! notification in flight is drained on shutdown instead of being lost.

use std::sync::Arc;

use sonar_core::{ArtifactEvent, ConnectionId, ServerFrame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::DeliveryFailed;
use super::registry::Registry;

/// Outcome of one fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    /// Connections removed because the frame could not be handed to them.
    pub evicted: Vec<ConnectionId>,
}

impl BroadcastReport {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.evicted.len()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver `event` to every connection subscribed to its device.
    ///
    /// Best effort and never retried. A blank device or a device without
    /// subscribers is a no-op, not an error.
    pub fn broadcast(&self, event: &ArtifactEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let Some(device) = event.device() else {
            return report;
        };
        let subscribers = self.registry.subscribers_of(&device);
        if subscribers.is_empty() {
            debug!(device = %device, "no subscribers for device");
            return report;
        }

        let json = match ServerFrame::new_audio(event).to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(device = %device, error = %e, "failed to serialize new_audio frame");
                return report;
            }
        };

        let mut failed: Vec<(ConnectionId, DeliveryFailed)> = Vec::new();
        for id in subscribers {
            let outcome = match self.registry.channel(&id) {
                Some(channel) => channel.send(Arc::clone(&json)),
                None => Err(DeliveryFailed::Gone),
            };
            match outcome {
                Ok(()) => report.delivered.push(id),
                Err(reason) => failed.push((id, reason)),
            }
        }

        for (id, reason) in failed {
            if let Some(channel) = self.registry.unregister(&id) {
                channel.close();
            }
            warn!(conn_id = %id, device = %device, reason = %reason, "delivery failed, evicting");
            report.evicted.push(id);
        }

        info!(
            device = %device,
            filename = %event.filename,
            delivered = report.delivered.len(),
            evicted = report.evicted.len(),
            "broadcast new_audio"
        );
        report
    }
}

/// Why a notification was not accepted for dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("dispatch queue full")]
    QueueFull,
    #[error("dispatcher stopped")]
    Stopped,
}

/// Handle used by the upload path to announce a newly recorded artifact.
///
/// Call only after the artifact has been durably recorded, so the live event
/// matches what a later history query returns.
#[derive(Clone)]
pub struct ArtifactNotifier {
    tx: mpsc::Sender<ArtifactEvent>,
}

impl ArtifactNotifier {
    pub fn notify_new_artifact(&self, event: ArtifactEvent) -> Result<(), NotifyError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(ev) => {
                warn!(device = %ev.device_name, filename = %ev.filename, "dispatch queue full, dropping event");
                NotifyError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => NotifyError::Stopped,
        })
    }
}

/// Spawn the dispatch worker.
///
/// The worker exits once `cancel` fires and the queue has been drained, or
/// when every notifier has been dropped.
pub fn start_dispatcher(
    dispatcher: Dispatcher,
    capacity: usize,
    cancel: CancellationToken,
) -> (ArtifactNotifier, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ArtifactEvent>(capacity);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(event) => { let _ = dispatcher.broadcast(&event); }
                    None => return,
                },
                () = cancel.cancelled() => break,
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            let _ = dispatcher.broadcast(&event);
            drained += 1;
        }
        debug!(drained, "dispatch worker stopped");
    });
    (ArtifactNotifier { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionChannel;
    use sonar_core::DeviceName;
    use std::time::Duration;

    type Outbox = mpsc::Receiver<Arc<String>>;

    fn connect(registry: &Registry, devices: &[&str]) -> (ConnectionId, ConnectionChannel, Outbox) {
        let (channel, rx) = ConnectionChannel::bounded(4);
        let id = registry.register(channel.clone());
        registry
            .set_subscriptions(&id, DeviceName::normalize_all(devices))
            .unwrap();
        (id, channel, rx)
    }

    fn event(device: &str) -> ArtifactEvent {
        ArtifactEvent::new(device, "2026-01-01T00:00:00.000Z", "take.wav", 128)
    }

    fn parse(msg: &str) -> serde_json::Value {
        serde_json::from_str(msg).unwrap()
    }

    #[test]
    fn delivers_to_subscriber_only() {
        let registry = Arc::new(Registry::new());
        let (c1, _ch1, mut rx1) = connect(&registry, &["sensor-a"]);
        let (_c2, _ch2, mut rx2) = connect(&registry, &["sensor-b"]);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let report = dispatcher.broadcast(&event("sensor-a"));
        assert_eq!(report.delivered, vec![c1]);
        assert!(report.evicted.is_empty());

        let frame = parse(&rx1.try_recv().unwrap());
        assert_eq!(frame["type"], "new_audio");
        assert_eq!(frame["deviceName"], "sensor-a");
        assert_eq!(frame["urlPath"], "/audios/take.wav");
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn matches_device_case_and_padding_insensitively() {
        let registry = Arc::new(Registry::new());
        let (_id, _ch, mut rx) = connect(&registry, &[" Device_1 "]);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let report = dispatcher.broadcast(&event("DEVICE_1"));
        assert_eq!(report.delivered.len(), 1);
        // raw spelling is preserved for display
        assert_eq!(parse(&rx.try_recv().unwrap())["deviceName"], "DEVICE_1");
    }

    #[test]
    fn no_subscribers_is_noop() {
        let registry = Arc::new(Registry::new());
        let (_id, _ch, mut rx) = connect(&registry, &["other"]);
        let report = Dispatcher::new(Arc::clone(&registry)).broadcast(&event("lonely"));
        assert_eq!(report, BroadcastReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn blank_device_is_noop() {
        let registry = Arc::new(Registry::new());
        let report = Dispatcher::new(registry).broadcast(&event("   "));
        assert_eq!(report.recipients(), 0);
    }

    #[test]
    fn broken_peer_is_evicted_once() {
        let registry = Arc::new(Registry::new());
        let (healthy, _ch1, mut rx1) = connect(&registry, &["mic"]);
        let (broken, broken_ch, rx2) = connect(&registry, &["mic", "other"]);
        drop(rx2);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let first = dispatcher.broadcast(&event("mic"));
        assert_eq!(first.delivered, vec![healthy.clone()]);
        assert_eq!(first.evicted, vec![broken.clone()]);
        assert!(broken_ch.is_closed());
        assert!(!registry.contains(&broken));
        assert!(registry.is_consistent());
        assert!(registry
            .subscribers_of(&DeviceName::normalize("other").unwrap())
            .is_empty());

        let second = dispatcher.broadcast(&event("mic"));
        assert_eq!(second.delivered, vec![healthy]);
        assert!(second.evicted.is_empty());
        let mut received = 0;
        while rx1.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[test]
    fn full_queue_counts_as_failure() {
        let registry = Arc::new(Registry::new());
        let (slow, _ch, _rx) = connect(&registry, &["mic"]);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        for _ in 0..4 {
            assert_eq!(dispatcher.broadcast(&event("mic")).delivered.len(), 1);
        }
        let report = dispatcher.broadcast(&event("mic"));
        assert_eq!(report.evicted, vec![slow]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn notifier_feeds_worker() {
        let registry = Arc::new(Registry::new());
        let (_id, _ch, mut rx) = connect(&registry, &["mic"]);
        let cancel = CancellationToken::new();
        let (notifier, handle) =
            start_dispatcher(Dispatcher::new(Arc::clone(&registry)), 8, cancel.clone());

        notifier.notify_new_artifact(event("mic")).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse(&msg)["type"], "new_audio");

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(notifier.notify_new_artifact(event("mic")), Err(NotifyError::Stopped));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_events() {
        let registry = Arc::new(Registry::new());
        let (_id, _ch, mut rx) = connect(&registry, &["mic"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (notifier, handle) =
            start_dispatcher(Dispatcher::new(Arc::clone(&registry)), 8, cancel);

        // queued before the worker first runs
        notifier.notify_new_artifact(event("mic")).unwrap();
        notifier.notify_new_artifact(event("mic")).unwrap();
        handle.await.unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn full_dispatch_queue_rejects() {
        let (tx, _rx) = mpsc::channel(1);
        let notifier = ArtifactNotifier { tx };
        notifier.notify_new_artifact(event("mic")).unwrap();
        assert_eq!(notifier.notify_new_artifact(event("mic")), Err(NotifyError::QueueFull));
    }
}
