use crate::model::Category;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no usable id")]
    MissingId,
    #[error("record has no coordinates")]
    MissingCoordinates,
    #[error("{field} is not numeric: {raw}")]
    InvalidCoordinate { field: &'static str, raw: String },
    #[error("{field}={value} is outside WGS84 bounds")]
    OutOfRange { field: &'static str, value: f64 },
}

impl RecordError {
    /// Positionless records are expected (reports filed without a pin) and not worth a warning.
    pub fn is_positionless(&self) -> bool {
        matches!(self, RecordError::MissingCoordinates)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("change stream connection failed: {0}")]
    Connection(String),
    #[error("change stream closed by source")]
    Closed,
    #[error("undecodable snapshot payload: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("routing provider failed: {0}")]
    Provider(String),
    #[error("routing provider timed out")]
    Timeout,
    #[error("no route found: {0}")]
    NoRoute(String),
    #[error("invalid route endpoints: {0}")]
    InvalidEndpoints(String),
    #[error("route request superseded by a newer request")]
    Superseded,
    #[error("sync session is closed")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("skipped malformed {category} record {}: {reason}", id.as_deref().unwrap_or("<no id>"))]
    MalformedRecord {
        category: Category,
        id: Option<String>,
        reason: RecordError,
    },
    #[error("{category} subscription failed (attempt {attempt}, retrying in {retry_in:?}): {source}")]
    SubscriptionFailure {
        category: Category,
        attempt: u32,
        retry_in: Duration,
        source: SourceError,
    },
    #[error(transparent)]
    RouteProviderFailure(#[from] RouteError),
    #[error("reconciliation invariant violated for {category}: {detail}")]
    ReconciliationInvariantViolation { category: Category, detail: String },
}
