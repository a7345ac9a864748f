//! The duty-cycle state machine.
//!
//! One call to [`Node::step`] evaluates the current state once. Nothing in a
//! step blocks without a ceiling except deep sleep, which is the point of
//! the Sleeping and Low Battery states.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use crate::commands::Command;
use crate::context::DeviceContext;
use crate::diagnostics::PublishGate;
use crate::errors::{CommandError, NodeError, ReportError, StoreError};
use crate::net::{self, ConnectionPolicy, Transport};
use crate::records::{ControlFlag, RESET_COUNT_SENTINEL};
use crate::recovery::{self, RecoveryAction};
use crate::reporter::{AckOutcome, TelemetryReporter};
use crate::simulate::MeasurementProvider;
use crate::sleep::{self, Platform, ResetReason, WakeSchedule, WakeSource};
use crate::types::{DeviceState, MeasurementSample};

pub const TRACE_CAPACITY: usize = 32;

const CONNECT_POLL: Duration = Duration::from_secs(1);
const MEASURE_EVERY_MINUTES: u32 = 5;
const MIN_REPORT_SPACING_SECS: i64 = 60;

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Restart(RecoveryAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub reinitialized: bool,
    pub pin_reset: bool,
    pub reset_count: u8,
    pub forced_full_reset: bool,
    pub connected: bool,
}

fn policy_for(low_power: bool) -> ConnectionPolicy {
    if low_power {
        ConnectionPolicy::OnDemand
    } else {
        ConnectionPolicy::Persistent
    }
}

pub struct Node<T, P, M> {
    ctx: DeviceContext,
    transport: T,
    platform: P,
    provider: M,
    reporter: TelemetryReporter,
    gate: PublishGate,
    schedule: WakeSchedule,
    policy: ConnectionPolicy,
    state: DeviceState,
    previous: DeviceState,
    trace: VecDeque<(DeviceState, DeviceState)>,
    latest: Option<MeasurementSample>,
    awake_until: DateTime<Utc>,
    error_since: Option<DateTime<Utc>>,
}

impl<T: Transport, P: Platform, M: MeasurementProvider> Node<T, P, M> {
    pub fn new(ctx: DeviceContext, transport: T, platform: P, provider: M) -> Self {
        let reporter = TelemetryReporter::new(
            ctx.config.report_topic.clone(),
            ctx.config.response_timeout_secs,
        );
        let gate = PublishGate::new(
            ctx.config.diagnostic_topic.clone(),
            ctx.config.diagnostic_interval(),
        );
        let schedule = WakeSchedule {
            period_secs: ctx.config.wake_period_secs,
            offset_secs: ctx.config.wake_offset_secs,
        };
        let awake_until = ctx.now();
        Node {
            ctx,
            transport,
            platform,
            provider,
            reporter,
            gate,
            schedule,
            policy: ConnectionPolicy::Persistent,
            state: DeviceState::Initialization,
            previous: DeviceState::Initialization,
            trace: VecDeque::with_capacity(TRACE_CAPACITY),
            latest: None,
            awake_until,
            error_since: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn previous_state(&self) -> DeviceState {
        self.previous
    }

    /// Most recent transitions, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &(DeviceState, DeviceState)> {
        self.trace.iter()
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn reporter(&self) -> &TelemetryReporter {
        &self.reporter
    }

    /// Load the record, handle reset bookkeeping, take a first reading and
    /// try to connect. Leaves the node in Idle, or in Error when the link
    /// could not be brought up.
    pub async fn boot(&mut self) -> Result<BootReport, NodeError> {
        let loaded = self.ctx.records.load()?;
        let mut reset_count = loaded.record.reset_count;

        let pin_reset = self.platform.reset_reason() == ResetReason::PinReset;
        if pin_reset {
            reset_count = reset_count.saturating_add(1);
            self.ctx.records.set_reset_count(reset_count)?;
        }

        let forced_full_reset = recovery::boot_loop_detected(reset_count);
        if forced_full_reset {
            warn!(reset_count, "Reset loop detected at boot, forcing full transport reset");
            self.transport.reset_stack().await;
            reset_count = RESET_COUNT_SENTINEL;
            self.ctx.records.set_reset_count(reset_count)?;
        }

        self.ctx.apply_time_zone(loaded.record.time_zone_offset);
        self.apply_policy(loaded.record.flags.low_power);

        let now = self.ctx.now();
        match self.provider.measure(now) {
            Ok(sample) => self.latest = Some(sample),
            Err(e) => warn!(error = %e, "Initial measurement failed"),
        }

        let connected = self.ensure_connected().await;

        self.awake_until = self.ctx.now() + secs(self.ctx.config.awake_secs);
        let report = BootReport {
            reinitialized: loaded.reinitialized,
            pin_reset,
            reset_count,
            forced_full_reset,
            connected,
        };
        info!(
            ?report,
            local_time = %self.ctx.local_now(),
            low_power = loaded.record.flags.low_power,
            "Boot complete"
        );
        self.transition_to(DeviceState::Idle).await?;
        if !connected {
            self.transition_to(DeviceState::Error).await?;
        }
        Ok(report)
    }

    pub async fn step(&mut self) -> Result<Control, NodeError> {
        self.drain_acknowledgments().await?;

        match self.state {
            DeviceState::Initialization => {
                self.boot().await?;
            }
            DeviceState::Idle => self.on_idle().await?,
            DeviceState::Measuring => self.on_measuring().await?,
            DeviceState::Reporting => self.on_reporting().await?,
            DeviceState::ResponseWait => self.on_response_wait().await?,
            DeviceState::Sleeping => self.on_sleeping().await?,
            DeviceState::LowBattery => return Ok(self.on_low_battery().await?),
            DeviceState::Error => return Ok(self.on_error().await?),
        }
        Ok(Control::Continue)
    }

    pub async fn handle_command(&mut self, command: Command) -> Result<(), CommandError> {
        info!(?command, "Remote command");
        match command {
            Command::Measure => {
                if self.reporter.transaction().is_some() {
                    return Err(CommandError::DeliveryInFlight);
                }
                self.transition_to(DeviceState::Measuring).await?;
            }
            Command::LowPower(enabled) => {
                self.ctx.records.set_flag(ControlFlag::LowPower, enabled)?;
                self.apply_policy(enabled);
                if enabled {
                    self.awake_until = self.ctx.now() + secs(self.ctx.config.awake_secs);
                }
            }
            Command::Verbose(enabled) => {
                self.ctx.records.set_flag(ControlFlag::Verbose, enabled)?;
            }
            Command::TimeZone(hours) => {
                let hours = self.ctx.records.set_time_zone_offset(hours)?;
                self.ctx.apply_time_zone(hours);
                info!(local_time = %self.ctx.local_now(), "Time zone updated");
            }
        }
        Ok(())
    }

    fn apply_policy(&mut self, low_power: bool) {
        self.policy = policy_for(low_power);
        self.transport.set_connection_policy(self.policy);
    }

    /// Brings the link up within the configured ceiling. False when it
    /// stayed down.
    async fn ensure_connected(&mut self) -> bool {
        if self.transport.is_connected() {
            return true;
        }
        let ceiling = self.ctx.config.connect_ceiling();
        match net::connect_with_retry(&mut self.transport, ceiling, CONNECT_POLL).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, policy = ?self.policy, "Connection failed");
                false
            }
        }
    }

    async fn transition_to(&mut self, next: DeviceState) -> Result<(), StoreError> {
        if next == self.state {
            return Ok(());
        }
        let from = self.state;
        self.previous = from;
        self.state = next;
        if self.trace.len() == TRACE_CAPACITY {
            self.trace.pop_front();
        }
        self.trace.push_back((from, next));
        info!(from = %from, to = %next, "State transition");

        if next == DeviceState::Error {
            self.error_since = Some(self.ctx.now());
            let alerts = self.ctx.records.increment_alert_count()?;
            debug!(alerts, "Alert recorded");
        }

        self.publish_status(&format!("From {} to {}", from, next), false).await
    }

    /// Goes through the publish gate when verbose diagnostics are on, or
    /// always when `always` is set.
    async fn publish_status(&mut self, message: &str, always: bool) -> Result<(), StoreError> {
        if always || self.ctx.records.get_flag(ControlFlag::Verbose)? {
            self.gate.publish(&mut self.transport, message).await;
        }
        Ok(())
    }

    async fn drain_acknowledgments(&mut self) -> Result<(), StoreError> {
        for outcome in self.reporter.poll_acknowledgments(&mut self.ctx)? {
            match outcome {
                AckOutcome::Acknowledged(_) => {}
                AckOutcome::Empty => self.publish_status("Empty response", true).await?,
                AckOutcome::Rejected(raw) | AckOutcome::Unsolicited(raw) => {
                    self.publish_status(&format!("Response: {}", raw), true).await?
                }
            }
        }
        Ok(())
    }

    fn measurement_due(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if !self.transport.clock_valid() || now.minute() % MEASURE_EVERY_MINUTES != 0 {
            return Ok(false);
        }
        let last_attempt = i64::from(self.ctx.records.last_attempt_epoch()?);
        Ok(now.timestamp() - last_attempt >= MIN_REPORT_SPACING_SECS)
    }

    async fn on_idle(&mut self) -> Result<(), StoreError> {
        let now = self.ctx.now();
        let threshold = self.ctx.config.low_battery_volts;
        if let Some(sample) = self.latest.as_ref().filter(|s| s.battery_volts <= threshold) {
            warn!(volts = sample.battery_volts, threshold, "Battery below threshold");
            return self.transition_to(DeviceState::LowBattery).await;
        }
        if self.policy == ConnectionPolicy::Persistent && !self.ensure_connected().await {
            return self.transition_to(DeviceState::Error).await;
        }
        if self.ctx.records.get_flag(ControlFlag::LowPower)? && now >= self.awake_until {
            return self.transition_to(DeviceState::Sleeping).await;
        }
        if self.measurement_due(now)? {
            return self.transition_to(DeviceState::Measuring).await;
        }
        Ok(())
    }

    async fn on_measuring(&mut self) -> Result<(), StoreError> {
        match self.provider.measure(self.ctx.now()) {
            Ok(sample) => {
                debug!(?sample, "Measurement taken");
                self.latest = Some(sample);
                self.transition_to(DeviceState::Reporting).await
            }
            Err(e) => {
                warn!(error = %e, "Measurement failed");
                self.transition_to(DeviceState::Error).await
            }
        }
    }

    async fn on_reporting(&mut self) -> Result<(), StoreError> {
        let connected = match self.policy {
            ConnectionPolicy::Persistent => self.transport.is_connected(),
            ConnectionPolicy::OnDemand => self.ensure_connected().await,
        };
        if !connected {
            warn!(policy = ?self.policy, "Not connected, cannot report");
            return self.transition_to(DeviceState::Error).await;
        }
        let Some(sample) = self.latest.clone() else {
            return self.transition_to(DeviceState::Measuring).await;
        };
        match self.reporter.send(&mut self.ctx, &mut self.transport, &sample).await {
            Ok(_) => self.transition_to(DeviceState::ResponseWait).await,
            Err(ReportError::Store(e)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Report failed");
                self.transition_to(DeviceState::Error).await
            }
        }
    }

    async fn on_response_wait(&mut self) -> Result<(), StoreError> {
        let now = self.ctx.now();
        if self.reporter.is_acknowledged() {
            self.reporter.resolve();
            let extended = now + secs(self.ctx.config.extended_awake_secs);
            self.awake_until = self.awake_until.max(extended);
            if self.policy == ConnectionPolicy::OnDemand {
                self.transport.disconnect().await;
                self.reporter.abandon_session();
            }
            return self.transition_to(DeviceState::Idle).await;
        }
        if self.reporter.poll_timeout(now) {
            warn!(
                timeout_secs = self.ctx.config.response_timeout_secs,
                "No acknowledgment, ending session"
            );
            self.transport.disconnect().await;
            self.reporter.abandon_session();
            return self.transition_to(DeviceState::Error).await;
        }
        Ok(())
    }

    async fn on_error(&mut self) -> Result<Control, StoreError> {
        let now = self.ctx.now();
        let entered = *self.error_since.get_or_insert(now);
        if !recovery::settled(entered, now, self.ctx.config.settle_delay_secs) {
            return Ok(Control::Continue);
        }

        let reset_count = self.ctx.records.reset_count()?;
        let last_success = self.ctx.records.last_report_epoch()?;
        let since_success = u64::from(self.ctx.epoch().saturating_sub(last_success));
        let action = recovery::decide(reset_count, since_success);
        warn!(?action, reset_count, since_success, "Recovering from error");

        self.publish_status(&format!("Recovering: {:?}", action), false).await?;
        if self.transport.is_connected() {
            time::sleep(self.ctx.config.flush_delay()).await;
        }
        self.reporter.abandon_session();
        match action {
            RecoveryAction::SimpleRestart => self.transport.disconnect().await,
            RecoveryAction::FullReset => {
                self.ctx.records.set_reset_count(0)?;
                self.transport.reset_stack().await;
            }
        }
        Ok(Control::Restart(action))
    }

    /// One-time actions before any deep sleep.
    async fn bedtime(&mut self) -> Result<(), StoreError> {
        self.publish_status("Going to sleep", false).await?;
        if self.transport.is_connected() {
            time::sleep(self.ctx.config.flush_delay()).await;
        }
        self.reporter.abandon_session();
        if self.policy == ConnectionPolicy::OnDemand {
            self.transport.disconnect().await;
        }
        self.platform.release_power();
        Ok(())
    }

    async fn on_sleeping(&mut self) -> Result<(), StoreError> {
        self.bedtime().await?;

        let delay = self.schedule.delay_from(u64::from(self.ctx.epoch()));
        let reason = self
            .platform
            .deep_sleep(Duration::from_secs(delay), WakeSource::TimerOrWakePin)
            .await;

        // The link comes back when the next report needs it, or from Idle
        // under the persistent policy.
        info!(?reason, local_time = %self.ctx.local_now(), "Awake");
        self.awake_until = self.ctx.now() + secs(self.ctx.config.awake_secs);
        self.transition_to(DeviceState::Idle).await
    }

    async fn on_low_battery(&mut self) -> Result<Control, StoreError> {
        self.bedtime().await?;
        let delay = sleep::low_battery_delay(u64::from(self.ctx.epoch()));
        self.platform
            .deep_sleep(Duration::from_secs(delay), WakeSource::TimerOnly)
            .await;
        // Whatever the battery did meanwhile, start over from a clean boot.
        Ok(Control::Restart(RecoveryAction::SimpleRestart))
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(value as i64)
}
