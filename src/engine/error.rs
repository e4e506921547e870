use ulid::Ulid;

use crate::model::BookingStatus;

/// Why the access gate denied an owner request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TrialExpired,
    PeriodExpired,
    Cancelled,
}

impl DenyReason {
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::TrialExpired => "trial period has expired",
            DenyReason::PeriodExpired => "billing period has expired",
            DenyReason::Cancelled => "subscription was cancelled",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Carries the id of the booking that blocks the requested window.
    Conflict(Ulid),
    InvalidState {
        from: BookingStatus,
        to: BookingStatus,
    },
    Forbidden(&'static str),
    /// Lock contention timeout — safe to retry with backoff.
    Busy,
    Denied(DenyReason),
    InvalidArgument(&'static str),
    LimitExceeded(&'static str),
    JournalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "slot no longer available: conflicts with booking {id}")
            }
            EngineError::InvalidState { from, to } => {
                write!(
                    f,
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Busy => write!(f, "busy: could not acquire business lock, retry"),
            EngineError::Denied(reason) => write!(f, "access denied: {}", reason.message()),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
