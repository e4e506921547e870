use crate::limits::SLOT_STEP_MINUTES;
use crate::model::*;

// ── Slot Generation ──────────────────────────────────────────────

/// Walk a working window in fixed steps, emitting every candidate
/// `[t, t + duration)` that still fits inside the window.
///
/// The step is `SLOT_STEP_MINUTES`, independent of the service
/// duration: a long service produces overlapping candidates, giving
/// the customer fine-grained start-time choice.
pub fn candidate_starts(hours: &DayHours, duration_minutes: u32) -> Vec<u16> {
    let mut starts = Vec::new();
    if !hours.active {
        return starts;
    }
    let duration = duration_minutes.min(u16::MAX as u32) as u16;
    let mut t = hours.start_minute;
    while t as u32 + duration as u32 <= hours.end_minute as u32 {
        starts.push(t);
        t = match t.checked_add(SLOT_STEP_MINUTES) {
            Some(next) => next,
            None => break,
        };
    }
    starts
}

/// Produce the day's slot sequence, marking each candidate unavailable
/// when its absolute span overlaps a busy booking.
///
/// `busy` holds the spans of the day's bookings in a slot-blocking
/// status; `day_start` is midnight of the queried civil day in Ms.
/// Output is ascending by start and freshly computed — never cached.
pub fn generate_slots(
    hours: &DayHours,
    duration_minutes: u32,
    busy: &[Span],
    day_start: Ms,
) -> Vec<SlotInfo> {
    candidate_starts(hours, duration_minutes)
        .into_iter()
        .map(|start_minute| {
            let end_minute = start_minute + duration_minutes as u16;
            let span = Span::new(
                day_start + start_minute as Ms * MS_PER_MINUTE,
                day_start + end_minute as Ms * MS_PER_MINUTE,
            );
            let occupied = busy.iter().any(|b| b.overlaps(&span));
            SlotInfo {
                start_minute,
                end_minute,
                available: !occupied,
            }
        })
        .collect()
}
