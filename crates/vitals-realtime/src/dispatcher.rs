//! Fan-out delivery with per-target failure isolation.

use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use tracing::{debug, warn};

use vitals_core::ConnectionId;

use crate::messages::Envelope;
use crate::registry::{ConnectionRegistry, Target};
use crate::transport::CloseReason;

/// Outcome of one delivery call. Informational only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Targets resolved from the indexes.
    pub attempted: usize,
    /// Targets that accepted the frame.
    pub delivered: usize,
    /// Targets whose send failed and were removed.
    pub failed: usize,
}

/// Resolves targets from the registry and sends to each independently.
///
/// A failed send removes that one connection and closes it; it never aborts
/// delivery to the other targets and never surfaces to the caller.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    /// Dispatcher over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Every live connection.
    pub async fn broadcast_all(&self, envelope: &Envelope) -> DeliveryReport {
        let targets = self.registry.targets_all();
        self.deliver(envelope, targets).await
    }

    /// Every connection that joined `room_id`.
    pub async fn broadcast_room(&self, room_id: &str, envelope: &Envelope) -> DeliveryReport {
        let targets = self.registry.targets_room(room_id);
        self.deliver(envelope, targets).await
    }

    /// Every connection owned by `user_id`.
    pub async fn send_user(&self, user_id: &str, envelope: &Envelope) -> DeliveryReport {
        let targets = self.registry.targets_user(user_id);
        self.deliver(envelope, targets).await
    }

    /// One connection.
    pub async fn send_to(&self, id: &ConnectionId, envelope: &Envelope) -> DeliveryReport {
        let targets = self.registry.target(id).into_iter().collect();
        self.deliver(envelope, targets).await
    }

    async fn deliver(&self, envelope: &Envelope, targets: Vec<Target>) -> DeliveryReport {
        let mut report = DeliveryReport {
            attempted: targets.len(),
            ..DeliveryReport::default()
        };
        if targets.is_empty() {
            return report;
        }

        let frame: Arc<str> = match envelope.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(kind = envelope.kind.name(), error = %e, "failed to serialize envelope");
                report.failed = report.attempted;
                return report;
            }
        };

        let sends = targets.iter().map(|t| {
            let frame = Arc::clone(&frame);
            async move { t.transport.send(frame).await }
        });
        let results = join_all(sends).await;

        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(conn_id = %target.id, kind = envelope.kind.name(), error = %e, "delivery failed, dropping connection");
                    counter!(crate::metrics::WS_DELIVERY_FAILURES_TOTAL).increment(1);
                    if let Some(removed) = self.registry.unregister(&target.id) {
                        removed.retire(CloseReason::DeliveryFailed).await;
                    }
                }
            }
        }

        debug!(
            kind = envelope.kind.name(),
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "delivered envelope"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, MockTransport, TransportError};
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Dispatcher) {
        let registry = Arc::new(ConnectionRegistry::new(3));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        (registry, dispatcher)
    }

    fn connect(
        registry: &ConnectionRegistry,
        user: &str,
        room: Option<&str>,
    ) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let (t, rx) = ChannelTransport::new(8);
        let id = registry
            .register(t, user.into(), user.into(), room.map(Into::into))
            .id;
        (id, rx)
    }

    fn failing() -> Arc<MockTransport> {
        let mut mock = MockTransport::new();
        let _ = mock
            .expect_send()
            .returning(|_| Err(TransportError::Other("broken pipe".into())));
        let _ = mock.expect_close().returning(|_| Ok(()));
        Arc::new(mock)
    }

    #[tokio::test]
    async fn broadcast_all_reaches_everyone_with_one_encoding() {
        let (registry, dispatcher) = setup();
        let (_, mut rx1) = connect(&registry, "u1", Some("r1"));
        let (_, mut rx2) = connect(&registry, "u2", None);

        let report = dispatcher.broadcast_all(&Envelope::system("hello")).await;
        assert_eq!(report, DeliveryReport { attempted: 2, delivered: 2, failed: 0 });

        let a = rx1.try_recv().unwrap();
        let b = rx2.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.contains(r#""type":"system""#));
    }

    #[tokio::test]
    async fn room_broadcast_skips_other_rooms() {
        let (registry, dispatcher) = setup();
        let (_, mut in_room) = connect(&registry, "u1", Some("r1"));
        let (_, mut elsewhere) = connect(&registry, "u2", Some("r2"));
        let (_, mut roomless) = connect(&registry, "u3", None);

        let report = dispatcher.broadcast_room("r1", &Envelope::system("r1 only")).await;
        assert_eq!(report.delivered, 1);
        assert!(in_room.try_recv().is_ok());
        assert!(elsewhere.try_recv().is_err());
        assert!(roomless.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_user_reaches_every_device() {
        let (registry, dispatcher) = setup();
        let (_, mut phone) = connect(&registry, "u1", None);
        let (_, mut laptop) = connect(&registry, "u1", Some("r1"));
        let (_, mut other) = connect(&registry, "u2", None);

        let report = dispatcher.send_user("u1", &Envelope::system("ping")).await;
        assert_eq!(report.delivered, 2);
        assert!(phone.try_recv().is_ok());
        assert!(laptop.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_single_connection() {
        let (registry, dispatcher) = setup();
        let (a, mut rx_a) = connect(&registry, "u1", None);
        let (_, mut rx_b) = connect(&registry, "u1", None);

        let report = dispatcher.send_to(&a, &Envelope::heartbeat()).await;
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_target_set_is_noop() {
        let (_registry, dispatcher) = setup();
        let report = dispatcher.broadcast_room("ghost", &Envelope::system("x")).await;
        assert_eq!(report, DeliveryReport::default());
        let report = dispatcher.send_to(&ConnectionId::new(), &Envelope::system("x")).await;
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn failed_target_is_removed_and_others_still_delivered() {
        let (registry, dispatcher) = setup();
        let (_, mut healthy) = connect(&registry, "u1", None);
        let broken_id = registry
            .register(failing(), "u2".into(), "u2".into(), None)
            .id;
        let (_, mut also_healthy) = connect(&registry, "u3", None);

        let report = dispatcher.broadcast_all(&Envelope::system("hi")).await;
        assert_eq!(report, DeliveryReport { attempted: 3, delivered: 2, failed: 1 });
        assert!(healthy.try_recv().is_ok());
        assert!(also_healthy.try_recv().is_ok());
        assert!(registry.connection_info(&broken_id).is_none());
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn full_queue_counts_as_failure() {
        let (registry, dispatcher) = setup();
        let (t, _rx) = ChannelTransport::new(1);
        let id = registry.register(t.clone(), "u1".into(), "u1".into(), None).id;

        assert_eq!(dispatcher.send_to(&id, &Envelope::system("1")).await.delivered, 1);
        let report = dispatcher.send_to(&id, &Envelope::system("2")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(registry.count(), 0);
        assert_eq!(t.close_reason(), Some(CloseReason::DeliveryFailed));
    }

    #[tokio::test]
    async fn send_to_removed_connection_is_swallowed() {
        let (registry, dispatcher) = setup();
        let (id, _rx) = connect(&registry, "u1", None);
        let _ = registry.unregister(&id);
        let report = dispatcher.send_to(&id, &Envelope::system("late")).await;
        assert_eq!(report.attempted, 0);
    }
}
