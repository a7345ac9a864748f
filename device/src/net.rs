use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::TransportError;

/// How the transport session should behave between reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// Stay connected for the whole awake period.
    Persistent,
    /// Connect only to report; drop the session before sleeping.
    OnDemand,
}

/// Channel on which the collector answers reports published under `topic`.
pub fn response_topic(topic: &str, device_id: &str) -> String {
    format!("hook-response/{}/{}", topic, device_id)
}

/// Wide-area link to the collector.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// True once network time has been obtained.
    fn clock_valid(&self) -> bool;

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError>;

    /// Messages arriving on `topic` are delivered on the returned channel.
    async fn subscribe(
        &mut self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, TransportError>;

    fn set_connection_policy(&mut self, policy: ConnectionPolicy);

    /// Tears down and rebuilds the whole transport stack.
    async fn reset_stack(&mut self);
}

/// Keeps trying to connect until `ceiling` elapses, yielding between tries.
pub async fn connect_with_retry<T: Transport>(
    transport: &mut T,
    ceiling: Duration,
    poll: Duration,
) -> Result<(), TransportError> {
    let started = Instant::now();
    let mut attempts = 0u32;
    while !transport.is_connected() {
        if started.elapsed() >= ceiling {
            warn!(attempts, ?ceiling, "Giving up on connection");
            return Err(TransportError::ConnectTimeout(ceiling));
        }
        attempts += 1;
        if let Err(e) = transport.connect().await {
            debug!(attempt = attempts, error = %e, "Connection attempt failed");
        }
        if !transport.is_connected() {
            time::sleep(poll).await;
        }
    }
    info!(attempts, elapsed = ?started.elapsed(), "Transport connected");
    Ok(())
}

/// Talks to the collector's HTTP API. Publish responses are routed to the
/// matching `hook-response` subscriber, standing in for the cloud's webhook
/// response events.
pub struct HttpTransport {
    client: Client,
    backend_url: String,
    device_id: String,
    auth_token: Option<String>,
    connected: bool,
    time_synced: bool,
    policy: ConnectionPolicy,
    subscriptions: HashMap<String, mpsc::UnboundedSender<String>>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Self {
        HttpTransport {
            client: Client::new(),
            backend_url: config.backend_url.clone(),
            device_id: config.device_id.clone(),
            auth_token: config.auth_token.clone(),
            connected: false,
            time_synced: false,
            policy: ConnectionPolicy::Persistent,
            subscriptions: HashMap::new(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let url = format!("{}/api/health", self.backend_url);
        let request = self.authorize(self.client.get(&url).timeout(Duration::from_secs(10)));
        request.send().await?.error_for_status()?;
        self.connected = true;
        self.time_synced = true;
        info!(backend = %self.backend_url, policy = ?self.policy, "Connected to collector");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            info!("Disconnecting from collector");
        }
        self.connected = false;
        self.subscriptions.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn clock_valid(&self) -> bool {
        self.time_synced
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let url = format!("{}/api/devices/{}/events/{}", self.backend_url, self.device_id, topic);
        let request = self.authorize(
            self.client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.to_string()),
        );
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.connected = false;
                return Err(e.into());
            }
        };
        let body = response.text().await?;
        debug!(topic, bytes = payload.len(), "Published event");

        if let Some(tx) = self.subscriptions.get(&response_topic(topic, &self.device_id)) {
            // The subscriber may already be gone after a timeout; that is fine.
            let _ = tx.send(body);
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.insert(topic.to_string(), tx);
        debug!(topic, "Subscribed");
        Ok(rx)
    }

    fn set_connection_policy(&mut self, policy: ConnectionPolicy) {
        self.policy = policy;
    }

    async fn reset_stack(&mut self) {
        warn!("Resetting transport stack");
        self.disconnect().await;
        self.client = Client::new();
        self.time_synced = false;
    }
}
