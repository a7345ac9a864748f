//! Test doubles for the node's collaborators.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::clock::ManualClock;
use crate::errors::{MeasurementError, TransportError};
use crate::net::{ConnectionPolicy, Transport};
use crate::simulate::MeasurementProvider;
use crate::sleep::{Platform, ResetReason, WakeReason, WakeSource};
use crate::types::{sample_at, MeasurementSample};

#[derive(Default)]
pub struct MockTransport {
    pub connected: bool,
    pub time_synced: bool,
    pub connect_failures_left: u32,
    pub connect_attempts: u32,
    pub fail_publish: bool,
    /// Sent back on the matching `hook-response` channel after each publish.
    pub auto_response: Option<String>,
    pub published: Vec<(String, String)>,
    pub subscriptions: HashMap<String, mpsc::UnboundedSender<String>>,
    pub policy: Option<ConnectionPolicy>,
    pub disconnects: u32,
    pub stack_resets: u32,
}

impl MockTransport {
    pub fn connected() -> Self {
        MockTransport {
            connected: true,
            time_synced: true,
            ..Default::default()
        }
    }

    pub fn failing_connects(failures: u32) -> Self {
        MockTransport {
            connect_failures_left: failures,
            ..Default::default()
        }
    }

    pub fn acknowledging(code: &str) -> Self {
        MockTransport {
            auto_response: Some(code.to_string()),
            ..Default::default()
        }
    }

    /// Delivers `message` to the subscriber of `topic`, if any is listening.
    pub fn respond(&self, topic: &str, message: &str) -> bool {
        self.subscriptions
            .get(topic)
            .map_or(false, |tx| tx.send(message.to_string()).is_ok())
    }

    pub fn messages_on(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connect_attempts += 1;
        if self.connect_failures_left > 0 {
            self.connect_failures_left -= 1;
            return Err(TransportError::NotConnected);
        }
        self.connected = true;
        self.time_synced = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        self.disconnects += 1;
        self.subscriptions.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn clock_valid(&self) -> bool {
        self.time_synced
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if !self.connected || self.fail_publish {
            return Err(TransportError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_string()));
        if let Some(response) = &self.auto_response {
            let prefix = format!("hook-response/{}/", topic);
            for (subscribed, tx) in &self.subscriptions {
                if subscribed.starts_with(&prefix) {
                    let _ = tx.send(response.clone());
                }
            }
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
        Ok(rx)
    }

    fn set_connection_policy(&mut self, policy: ConnectionPolicy) {
        self.policy = Some(policy);
    }

    async fn reset_stack(&mut self) {
        self.stack_resets += 1;
        self.connected = false;
        self.time_synced = false;
        self.subscriptions.clear();
    }
}

/// Records sleeps and moves the shared clock forward by the slept time.
pub struct MockPlatform {
    pub reset_reason: ResetReason,
    pub clock: ManualClock,
    pub sleeps: Vec<(Duration, WakeSource)>,
    pub power_releases: u32,
}

impl MockPlatform {
    pub fn new(reset_reason: ResetReason, clock: ManualClock) -> Self {
        MockPlatform {
            reset_reason,
            clock,
            sleeps: Vec::new(),
            power_releases: 0,
        }
    }
}

impl Platform for MockPlatform {
    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    async fn deep_sleep(&mut self, duration: Duration, source: WakeSource) -> WakeReason {
        self.sleeps.push((duration, source));
        self.clock.advance(duration.as_secs() as i64);
        WakeReason::Timer
    }

    fn release_power(&mut self) {
        self.power_releases += 1;
    }
}

/// Replays scripted results, then falls back to healthy samples.
pub struct ScriptedProvider {
    pub battery_volts: f32,
    pub script: VecDeque<Result<MeasurementSample, MeasurementError>>,
    pub calls: u32,
}

impl ScriptedProvider {
    pub fn healthy(battery_volts: f32) -> Self {
        ScriptedProvider {
            battery_volts,
            script: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn fail_next(&mut self) {
        self.script
            .push_back(Err(MeasurementError("scripted failure".to_string())));
    }
}

impl MeasurementProvider for ScriptedProvider {
    fn measure(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<MeasurementSample, MeasurementError> {
        self.calls += 1;
        self.script
            .pop_front()
            .unwrap_or_else(|| Ok(sample_at(now, self.battery_volts)))
    }
}
