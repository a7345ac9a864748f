use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::context::DeviceContext;
use crate::errors::{ReportError, StoreError};
use crate::net::{response_topic, Transport};
use crate::records::U8Field;
use crate::types::{DeliveryPayload, MeasurementSample};

/// One report-and-acknowledge cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTransaction {
    pub payload: String,
    pub sent_at: DateTime<Utc>,
    pub in_flight: bool,
    pub acknowledged: bool,
}

/// What a single message on the response channel amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged(u16),
    /// Parsed or not, it was not a success code.
    Rejected(String),
    Empty,
    /// A success code with nothing waiting for it (late or duplicate).
    Unsolicited(String),
}

fn parse_status(raw: &str) -> Option<u16> {
    raw.trim().parse().ok()
}

pub struct TelemetryReporter {
    topic: String,
    timeout: Duration,
    transaction: Option<DeliveryTransaction>,
    responses: Option<mpsc::UnboundedReceiver<String>>,
}

impl TelemetryReporter {
    pub fn new(topic: impl Into<String>, timeout_secs: u64) -> Self {
        TelemetryReporter {
            topic: topic.into(),
            timeout: Duration::seconds(timeout_secs as i64),
            transaction: None,
            responses: None,
        }
    }

    pub fn transaction(&self) -> Option<&DeliveryTransaction> {
        self.transaction.as_ref()
    }

    pub fn in_flight(&self) -> bool {
        self.transaction.as_ref().map_or(false, |tx| tx.in_flight)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.transaction.as_ref().map_or(false, |tx| tx.acknowledged)
    }

    /// Publishes `sample` and opens the single delivery transaction.
    pub async fn send<T: Transport>(
        &mut self,
        ctx: &mut DeviceContext,
        transport: &mut T,
        sample: &MeasurementSample,
    ) -> Result<&DeliveryTransaction, ReportError> {
        if self.transaction.is_some() {
            return Err(ReportError::InFlight);
        }
        if self.responses.is_none() {
            let topic = response_topic(&self.topic, &ctx.config.device_id);
            self.responses = Some(transport.subscribe(&topic).await?);
        }

        let resets = ctx.records.reset_count()?;
        let alerts = ctx.records.get_u8(U8Field::AlertCount)?;
        let payload = serde_json::to_string(&DeliveryPayload::new(sample, resets, alerts))?;
        transport.publish(&self.topic, &payload).await?;

        let sent_at = ctx.now();
        let epoch = ctx.epoch();
        ctx.records.record_report_attempt(epoch)?;
        info!(
            topic = %self.topic,
            %sent_at,
            bytes = payload.len(),
            "Report sent, awaiting acknowledgment"
        );

        Ok(self.transaction.insert(DeliveryTransaction {
            payload,
            sent_at,
            in_flight: true,
            acknowledged: false,
        }))
    }

    /// Drains the response channel without blocking.
    pub fn poll_acknowledgments(
        &mut self,
        ctx: &mut DeviceContext,
    ) -> Result<Vec<AckOutcome>, StoreError> {
        let mut received = Vec::new();
        let mut closed = false;
        if let Some(rx) = self.responses.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(raw) => received.push(raw),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            debug!("Response subscription closed");
            self.responses = None;
        }
        received
            .into_iter()
            .map(|raw| self.on_acknowledgment(ctx, &raw))
            .collect()
    }

    pub fn on_acknowledgment(
        &mut self,
        ctx: &mut DeviceContext,
        raw: &str,
    ) -> Result<AckOutcome, StoreError> {
        if raw.trim().is_empty() {
            warn!("Empty response from collector");
            return Ok(AckOutcome::Empty);
        }
        let code = match parse_status(raw) {
            Some(code @ (200 | 201)) => code,
            _ => {
                warn!(response = raw, "Collector rejected report");
                return Ok(AckOutcome::Rejected(raw.to_string()));
            }
        };

        match self.transaction.as_mut() {
            Some(tx) if tx.in_flight && !tx.acknowledged => {
                tx.acknowledged = true;
                tx.in_flight = false;
                let epoch = ctx.epoch();
                ctx.records.record_report_success(epoch)?;
                info!(code, epoch, "Report acknowledged");
                Ok(AckOutcome::Acknowledged(code))
            }
            _ => {
                debug!(code, "Ignoring acknowledgment with no delivery in flight");
                Ok(AckOutcome::Unsolicited(raw.to_string()))
            }
        }
    }

    /// True once an unacknowledged delivery has outlived the timeout bound.
    pub fn poll_timeout(&self, now: DateTime<Utc>) -> bool {
        match &self.transaction {
            Some(tx) if tx.in_flight && !tx.acknowledged => now - tx.sent_at > self.timeout,
            _ => false,
        }
    }

    /// Destroys the resolved transaction so the next report can start.
    pub fn resolve(&mut self) -> Option<DeliveryTransaction> {
        self.transaction.take()
    }

    /// Forgets the transaction and the response subscription together, so
    /// nothing from the old session can be mistaken for a new answer.
    pub fn abandon_session(&mut self) {
        if let Some(tx) = self.transaction.take() {
            warn!(sent_at = %tx.sent_at, acknowledged = tx.acknowledged, "Abandoning delivery");
        }
        self.responses = None;
    }
}
