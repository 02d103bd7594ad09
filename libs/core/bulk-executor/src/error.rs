//! Error types and store-error classification
//!
//! Raw store failures are normalized into an [`ErrorKind`] that decides retry behavior:
//! - **Throttled / Timeout / Transient**: retry with exponential backoff
//! - **Conflict**: success for an idempotent insert of the same document, fatal otherwise
//! - **NotFound**: already satisfied for deletes, fatal for inserts
//! - **Unauthorized / Forbidden / Malformed**: fatal, never retried
//! - **CircuitOpen**: produced locally when the breaker rejects a batch

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::store::{AttemptOutcome, OperationType};

/// Normalized failure kind of a single item attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limit signal from the store (HTTP 429 equivalent)
    Throttled,
    /// Request timed out; the write may or may not have been applied
    Timeout,
    /// Item with the same key already exists
    Conflict,
    /// Credentials rejected
    Unauthorized,
    /// Credentials valid but operation not permitted
    Forbidden,
    /// Item does not exist
    NotFound,
    /// Generic server-side failure (5xx equivalent)
    Transient,
    /// Payload rejected as invalid
    Malformed,
    /// Batch short-circuited by an open circuit breaker
    CircuitOpen,
}

impl ErrorKind {
    /// Whether this kind is retried by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::Timeout | ErrorKind::Transient
        )
    }
}

/// Result of classifying a raw store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
        }
    }
}

/// What the executor should do with a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The desired end state already holds; count as success
    Satisfied,
    /// Resubmit in the next retry round
    Retry,
    /// Terminal failure
    Fail,
}

const THROTTLE_MARKERS: &[&str] = &[
    "too many requests",
    "request rate is large",
    "rate limit",
    "throttl",
];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded"];
const CONFLICT_MARKERS: &[&str] = &["conflict", "duplicate key", "already exists"];
const NOT_FOUND_MARKERS: &[&str] = &["not found", "does not exist"];
const MALFORMED_MARKERS: &[&str] = &["malformed", "bad request", "invalid", "too large"];

/// Classify a raw store error by status, vendor code and message.
///
/// Status codes win over codes, codes win over message text. Unknown failures are
/// treated as `Transient`, honoring the store's own retryable hint when present.
pub fn classify(
    status: Option<u16>,
    code: Option<&str>,
    message: &str,
    retryable_hint: Option<bool>,
) -> Classification {
    if let Some(kind) = status.and_then(kind_from_status) {
        return Classification::of(kind);
    }

    if let Some(kind) = code.and_then(kind_from_code) {
        return Classification::of(kind);
    }

    let message = message.to_ascii_lowercase();
    let kind = if contains_any(&message, THROTTLE_MARKERS) {
        Some(ErrorKind::Throttled)
    } else if contains_any(&message, TIMEOUT_MARKERS) {
        Some(ErrorKind::Timeout)
    } else if contains_any(&message, CONFLICT_MARKERS) {
        Some(ErrorKind::Conflict)
    } else if message.contains("unauthorized") {
        Some(ErrorKind::Unauthorized)
    } else if message.contains("forbidden") {
        Some(ErrorKind::Forbidden)
    } else if contains_any(&message, NOT_FOUND_MARKERS) {
        Some(ErrorKind::NotFound)
    } else if contains_any(&message, MALFORMED_MARKERS) {
        Some(ErrorKind::Malformed)
    } else {
        None
    };

    match kind {
        Some(kind) => Classification::of(kind),
        None => Classification {
            kind: ErrorKind::Transient,
            retryable: retryable_hint.unwrap_or(true),
        },
    }
}

/// Classify a failed attempt outcome.
pub fn classify_outcome(outcome: &AttemptOutcome) -> Classification {
    classify(
        outcome.status,
        outcome.error_code.as_deref(),
        outcome.message.as_deref().unwrap_or_default(),
        outcome.retryable,
    )
}

/// Decide the fate of a failed item from its classification.
///
/// `Conflict` always resolves to `Fail` here; idempotent conflict confirmation needs the
/// store and is handled by the executor.
pub fn resolve(classification: Classification, operation: OperationType) -> Resolution {
    match (classification.kind, operation) {
        (ErrorKind::NotFound, OperationType::Delete) => Resolution::Satisfied,
        (ErrorKind::CircuitOpen, _) => Resolution::Fail,
        _ if classification.retryable => Resolution::Retry,
        _ => Resolution::Fail,
    }
}

fn kind_from_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::Throttled),
        408 => Some(ErrorKind::Timeout),
        409 => Some(ErrorKind::Conflict),
        401 => Some(ErrorKind::Unauthorized),
        403 => Some(ErrorKind::Forbidden),
        404 => Some(ErrorKind::NotFound),
        400 | 413 | 422 => Some(ErrorKind::Malformed),
        // 449 is "retry with" on Cosmos DB
        449 | 500..=599 => Some(ErrorKind::Transient),
        _ => None,
    }
}

fn kind_from_code(code: &str) -> Option<ErrorKind> {
    let normalized: String = code
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "toomanyrequests" | "requestratetoolarge" | "throttled" | "16500" => {
            Some(ErrorKind::Throttled)
        }
        "timeout" | "requesttimeout" | "etimedout" | "50" => Some(ErrorKind::Timeout),
        "conflict" | "duplicatekey" | "11000" => Some(ErrorKind::Conflict),
        "unauthorized" => Some(ErrorKind::Unauthorized),
        "forbidden" => Some(ErrorKind::Forbidden),
        "notfound" => Some(ErrorKind::NotFound),
        "badrequest" | "malformed" | "invaliddocument" => Some(ErrorKind::Malformed),
        "serviceunavailable" | "internalservererror" | "econnreset" | "connection" => {
            Some(ErrorKind::Transient)
        }
        other => other.parse::<u16>().ok().and_then(kind_from_status),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Errors returned by the store collaborator for a whole bulk call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection-level failure; every item in the call is considered failed and retryable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Requested capability is not implemented by the store
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Errors that abort a run before any batch is dispatched.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Batch configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A document lacks the id field or partition key
    #[error("Item {index} is missing required field '{field}'")]
    MissingField { field: String, index: usize },

    /// A document cannot be addressed (not an object, non-scalar key, ...)
    #[error("Item {index} is invalid: {details}")]
    InvalidDocument { index: usize, details: String },

    /// Loading configuration from the environment failed
    #[error(transparent)]
    Config(#[from] core_config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BulkResult<T> = Result<T, BulkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify(Some(429), None, "", None).kind, ErrorKind::Throttled);
        assert_eq!(classify(Some(408), None, "", None).kind, ErrorKind::Timeout);
        assert_eq!(classify(Some(409), None, "", None).kind, ErrorKind::Conflict);
        assert_eq!(classify(Some(401), None, "", None).kind, ErrorKind::Unauthorized);
        assert_eq!(classify(Some(403), None, "", None).kind, ErrorKind::Forbidden);
        assert_eq!(classify(Some(404), None, "", None).kind, ErrorKind::NotFound);
        assert_eq!(classify(Some(400), None, "", None).kind, ErrorKind::Malformed);
        assert_eq!(classify(Some(503), None, "", None).kind, ErrorKind::Transient);
    }

    #[test]
    fn test_retryable_verdicts() {
        assert!(classify(Some(429), None, "", None).retryable);
        assert!(classify(Some(408), None, "", None).retryable);
        assert!(classify(Some(500), None, "", None).retryable);
        assert!(!classify(Some(401), None, "", None).retryable);
        assert!(!classify(Some(403), None, "", None).retryable);
        assert!(!classify(Some(400), None, "", None).retryable);
        assert!(!classify(Some(409), None, "", None).retryable);
    }

    #[test]
    fn test_status_overrides_retryable_hint() {
        let classification = classify(Some(401), None, "", Some(true));
        assert_eq!(classification.kind, ErrorKind::Unauthorized);
        assert!(!classification.retryable);
    }

    #[test]
    fn test_vendor_codes() {
        assert_eq!(classify(None, Some("16500"), "", None).kind, ErrorKind::Throttled);
        assert_eq!(classify(None, Some("11000"), "", None).kind, ErrorKind::Conflict);
        assert_eq!(
            classify(None, Some("TooManyRequests"), "", None).kind,
            ErrorKind::Throttled
        );
        assert_eq!(classify(None, Some("Not-Found"), "", None).kind, ErrorKind::NotFound);
        assert_eq!(classify(None, Some("503"), "", None).kind, ErrorKind::Transient);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify(None, None, "Request rate is large. More Request Units may be needed", None)
                .kind,
            ErrorKind::Throttled
        );
        assert_eq!(
            classify(None, None, "E11000 duplicate key error collection", None).kind,
            ErrorKind::Conflict
        );
        assert_eq!(
            classify(None, None, "operation timed out", None).kind,
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_unknown_error_uses_hint() {
        let default = classify(None, None, "something odd", None);
        assert_eq!(default.kind, ErrorKind::Transient);
        assert!(default.retryable);

        let hinted = classify(None, None, "something odd", Some(false));
        assert_eq!(hinted.kind, ErrorKind::Transient);
        assert!(!hinted.retryable);
    }

    #[test]
    fn test_resolution() {
        let not_found = classify(Some(404), None, "", None);
        assert_eq!(resolve(not_found, OperationType::Delete), Resolution::Satisfied);
        assert_eq!(resolve(not_found, OperationType::Insert), Resolution::Fail);

        let throttled = classify(Some(429), None, "", None);
        assert_eq!(resolve(throttled, OperationType::Insert), Resolution::Retry);

        let conflict = classify(Some(409), None, "", None);
        assert_eq!(resolve(conflict, OperationType::Insert), Resolution::Fail);

        let circuit = Classification {
            kind: ErrorKind::CircuitOpen,
            retryable: true,
        };
        assert_eq!(resolve(circuit, OperationType::Insert), Resolution::Fail);
    }

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
        assert_eq!("not_found".parse::<ErrorKind>().unwrap(), ErrorKind::NotFound);
    }
}
