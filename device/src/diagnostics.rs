use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::net::Transport;

/// Single outlet for status messages, spacing publishes so the collector's
/// per-device rate ceiling is never hit.
pub struct PublishGate {
    topic: String,
    min_interval: Duration,
    last_publish: Option<Instant>,
}

impl PublishGate {
    pub fn new(topic: impl Into<String>, min_interval: Duration) -> Self {
        PublishGate {
            topic: topic.into(),
            min_interval,
            last_publish: None,
        }
    }

    /// Waits out the remainder of the interval if needed, then publishes.
    /// Returns whether the message went out.
    pub async fn publish<T: Transport>(&mut self, transport: &mut T, message: &str) -> bool {
        if !transport.is_connected() {
            debug!(message, "Not connected, diagnostic dropped");
            return false;
        }
        if let Some(last) = self.last_publish {
            time::sleep_until(last + self.min_interval).await;
        }
        self.last_publish = Some(Instant::now());
        match transport.publish(&self.topic, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, message, "Diagnostic publish failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[tokio::test(start_paused = true)]
    async fn publishes_are_spaced_by_the_interval() {
        let mut transport = MockTransport::connected();
        let mut gate = PublishGate::new("status", Duration::from_secs(1));

        let started = Instant::now();
        assert!(gate.publish(&mut transport, "one").await);
        assert!(gate.publish(&mut transport, "two").await);
        assert!(gate.publish(&mut transport, "three").await);

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.messages_on("status"), vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_once_the_interval_has_passed() {
        let mut transport = MockTransport::connected();
        let mut gate = PublishGate::new("status", Duration::from_secs(1));
        gate.publish(&mut transport, "one").await;
        time::advance(Duration::from_secs(5)).await;

        let before = Instant::now();
        gate.publish(&mut transport, "two").await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn disconnected_transport_drops_the_message() {
        let mut transport = MockTransport::default();
        let mut gate = PublishGate::new("status", Duration::from_secs(1));
        assert!(!gate.publish(&mut transport, "lost").await);
        assert!(transport.published.is_empty());
    }
}
