//! Hard caps and policy constants. Caps bound memory and journal growth
//! per tenant; policy constants are fixed platform behavior, not
//! per-business configuration.

use crate::model::Ms;

// ── Tenancy ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 256;

// ── Per-tenant caps ──────────────────────────────────────────────

pub const MAX_BUSINESSES_PER_TENANT: usize = 10_000;
pub const MAX_SERVICES_PER_BUSINESS: usize = 500;
pub const MAX_BOOKINGS_PER_BUSINESS: usize = 100_000;

// ── Field caps ───────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_PAYMENT_FIELD_LEN: usize = 256;

// ── Timestamp sanity ─────────────────────────────────────────────

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// No single booking spans more than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;

// ── Scheduling policy ────────────────────────────────────────────

pub const MINUTES_PER_DAY: u16 = 1_440;
/// Candidate-slot step. Fixed platform-wide, independent of service
/// duration.
pub const SLOT_STEP_MINUTES: u16 = 30;
/// An active working window must span at least this much.
pub const MIN_WORKING_SPAN_MINUTES: u16 = 60;
pub const MIN_SERVICE_DURATION_MINUTES: u32 = 5;

// ── Billing policy ───────────────────────────────────────────────

pub const TRIAL_PERIOD_MS: Ms = 7 * 86_400_000;
pub const BILLING_PERIOD_MS: Ms = 30 * 86_400_000;

// ── Contention ───────────────────────────────────────────────────

/// How long booking admission waits for the business write lock before
/// failing with a retryable `Busy`.
pub const LOCK_WAIT_MS: u64 = 2_000;
