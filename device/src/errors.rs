use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("access at offset {offset} (len {len}) is outside the {size}-byte region")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("gave up connecting after {0:?}")]
    ConnectTimeout(std::time::Duration),
}

#[derive(Debug, Error)]
#[error("measurement failed: {0}")]
pub struct MeasurementError(pub String);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("a delivery transaction is already in flight")]
    InFlight,

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("time zone offset {0} is outside [-12, 12]")]
    TimeZoneOutOfRange(i32),

    #[error("cannot start a measurement while a delivery is in flight")]
    DeliveryInFlight,

    #[error("unrecognized command: {0:?}")]
    Unrecognized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that escape the control loop. Everything else is absorbed by the
/// Error state and the recovery policy.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
