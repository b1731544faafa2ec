use std::sync::Arc;

use leasy_core::wire::ChatPayload;
use leasy_telemetry::MetricsRecorder;

use crate::registry::ConnectionRegistry;

/// Pure dispatch over live connections. Receives payloads that the reliable
/// path has already persisted and forwards them verbatim; no retry, no
/// queuing. A payload nobody is listening for is simply not pushed: the
/// recipient sees it on the next conversation fetch and the unread marker
/// surfaces a notification either way.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(registry: Arc<ConnectionRegistry>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            registry,
            metrics: Some(metrics),
        }
    }

    /// Forward the payload to every live connection the recipient has open
    /// towards the sender. Returns how many copies were delivered; the count
    /// is logged and metered but deliberately not reported back to senders.
    pub fn route(&self, payload: &ChatPayload) -> usize {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize payload for push");
                return 0;
            }
        };

        let recipients = self
            .registry
            .find_recipients(&payload.sender, &payload.recipient);

        let mut delivered = 0;
        for conn in &recipients {
            if conn.forward(raw.clone()) {
                delivered += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("messages.routed", &[], delivered as u64);
            if delivered == 0 {
                metrics.counter_inc("messages.push_fallback", &[], 1);
            }
        }

        tracing::debug!(
            sender = %payload.sender,
            recipient = %payload.recipient,
            delivered = delivered,
            "routed payload"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoutingKey;
    use leasy_core::ids::UserId;

    fn key(sender: &str, counterparty: &str, origin: &str) -> RoutingKey {
        RoutingKey {
            sender: UserId::from_raw(sender),
            counterparty: UserId::from_raw(counterparty),
            origin: origin.into(),
        }
    }

    fn payload(sender: &str, recipient: &str, text: &str) -> ChatPayload {
        ChatPayload::text(UserId::from_raw(sender), UserId::from_raw(recipient), text)
    }

    #[test]
    fn routes_to_recipient_connection() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(Arc::clone(&registry));

        let (_id, mut rx) = registry.register(key("b", "a", "chat"));

        let delivered = router.route(&payload("a", "b", "hello"));
        assert_eq!(delivered, 1);

        let raw = rx.try_recv().unwrap();
        let received: ChatPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(received, payload("a", "b", "hello"));
    }

    #[test]
    fn forwards_payload_verbatim() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(Arc::clone(&registry));

        let (_id, mut rx) = registry.register(key("b", "a", "chat"));

        let sent = payload("a", "b", "hello");
        router.route(&sent);

        let raw = rx.try_recv().unwrap();
        assert_eq!(raw, serde_json::to_string(&sent).unwrap());
    }

    #[test]
    fn no_live_connection_is_not_an_error() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(registry);
        let delivered = router.route(&payload("a", "b", "nobody home"));
        assert_eq!(delivered, 0);
    }

    #[test]
    fn double_registration_single_delivery() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(Arc::clone(&registry));

        let (_id1, mut rx1) = registry.register(key("b", "a", "chat"));
        let (_id2, mut rx2) = registry.register(key("b", "a", "chat"));

        let delivered = router.route(&payload("a", "b", "once"));
        assert_eq!(delivered, 1);

        let copies = usize::from(rx1.try_recv().is_ok()) + usize::from(rx2.try_recv().is_ok());
        assert_eq!(copies, 1);
    }

    #[test]
    fn distinct_origins_each_receive_one_copy() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(Arc::clone(&registry));

        let (_id1, mut rx1) = registry.register(key("b", "a", "overview"));
        let (_id2, mut rx2) = registry.register(key("b", "a", "chat"));

        let delivered = router.route(&payload("a", "b", "fan out"));
        assert_eq!(delivered, 2);

        assert_eq!(rx1.try_recv().unwrap(), rx2.try_recv().unwrap());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn sender_windows_do_not_receive_their_own_push() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = MessageRouter::new(Arc::clone(&registry));

        let (_id, mut own_rx) = registry.register(key("a", "b", "chat"));

        let delivered = router.route(&payload("a", "b", "echo?"));
        assert_eq!(delivered, 0);
        assert!(own_rx.try_recv().is_err());
    }
}
