use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidArgument("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Find a booking in a slot-blocking status whose interval overlaps the
/// requested window. One predicate — `Span::overlaps`, the half-open
/// two-inequality test — shared with the slot generator.
pub(crate) fn find_conflict(bs: &BusinessState, span: &Span) -> Option<Ulid> {
    bs.bookings_overlapping(span)
        .find(|b| b.status.blocks_slot())
        .map(|b| b.id)
}

/// Admission-side guard: error with the blocking booking's id.
pub(crate) fn check_no_conflict(bs: &BusinessState, span: &Span) -> Result<(), EngineError> {
    match find_conflict(bs, span) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}
