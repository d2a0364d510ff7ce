use ulid::Ulid;

use crate::model::{Day, Version};

/// Which booking rule a proposed stay broke, with the configured limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    StayTooLong { requested_days: i64, max_days: u32 },
    TooSoon { earliest: Day, min_days_ahead: u32 },
    TooFarAhead { latest: Day, max_days_ahead: u32 },
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::StayTooLong { requested_days, max_days } => write!(
                f,
                "length of stay ({requested_days} days) can't exceed {max_days} days"
            ),
            PolicyViolation::TooSoon { earliest, min_days_ahead } => write!(
                f,
                "reservations must be made at least {min_days_ahead} days in advance (earliest start: {earliest})"
            ),
            PolicyViolation::TooFarAhead { latest, max_days_ahead } => write!(
                f,
                "reservations can't be made more than {max_days_ahead} days in advance (latest start: {latest})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidArgument(&'static str),
    PolicyViolation(PolicyViolation),
    Conflict(Ulid),
    StaleVersion {
        id: Ulid,
        expected: Version,
        actual: Option<Version>,
    },
    StoreUnavailable(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::PolicyViolation(_) => "policy_violation",
            EngineError::Conflict(_) => "conflict",
            EngineError::StaleVersion { .. } => "stale_version",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::PolicyViolation(v) => write!(f, "policy violation: {v}"),
            EngineError::Conflict(id) => {
                write!(f, "an existing reservation conflicts with the selected dates: {id}")
            }
            EngineError::StaleVersion { id, expected, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "stale version for reservation {id}: expected {expected}, current is {actual}"
                ),
                None => write!(
                    f,
                    "stale version for reservation {id}: expected {expected}, reservation no longer exists"
                ),
            },
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PolicyViolation> for EngineError {
    fn from(v: PolicyViolation) -> Self {
        EngineError::PolicyViolation(v)
    }
}

/// Failures a `ReservationStore` can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    StaleVersion {
        id: Ulid,
        expected: Version,
        actual: Option<Version>,
    },
    Conflict(Ulid),
    Rejected(&'static str),
    /// The store holds as many reservations as it is allowed to.
    Full,
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::StaleVersion { id, expected, actual } => {
                write!(f, "stale version for {id}: expected {expected}, actual {actual:?}")
            }
            StoreError::Conflict(id) => write!(f, "overlaps reservation {id}"),
            StoreError::Rejected(msg) => write!(f, "rejected: {msg}"),
            StoreError::Full => write!(f, "reservation capacity reached"),
            StoreError::Unavailable(e) => write!(f, "unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StaleVersion { id, expected, actual } => {
                EngineError::StaleVersion { id, expected, actual }
            }
            StoreError::Conflict(id) => EngineError::Conflict(id),
            StoreError::Rejected(msg) => EngineError::InvalidArgument(msg),
            StoreError::Full => EngineError::StoreUnavailable(StoreError::Full.to_string()),
            StoreError::Unavailable(e) => EngineError::StoreUnavailable(e),
        }
    }
}
