use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The uniform overlap test. Used by both the slot generator and the
    /// admission controller — adjacency is not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Render a minute-of-day as `HH:MM`.
pub fn minute_label(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

// ── Working hours ────────────────────────────────────────────────

/// One weekday's working window, minutes-of-day, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub start_minute: u16,
    pub end_minute: u16,
    pub active: bool,
}

/// A weekday entry of a bulk working-hours replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub weekday: u8,
    pub start_minute: u16,
    pub end_minute: u16,
    pub active: bool,
}

// ── Services ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Ulid,
    pub duration_minutes: u32,
    pub price_cents: i64,
    pub active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// Only non-terminal bookings occupy slots and participate in
    /// conflict checks.
    pub fn blocks_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// The explicit transition table.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Confirmed | Self::Completed | Self::Cancelled | Self::NoShow
            ),
            Self::Confirmed => {
                matches!(next, Self::Completed | Self::Cancelled | Self::NoShow)
            }
            Self::Completed | Self::Cancelled | Self::NoShow => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "no_show" | "no-show" => Some(Self::NoShow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub service_id: Ulid,
    /// None for guest bookings.
    pub customer_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub is_paid: bool,
    pub payment_method: Option<String>,
    pub payment_ref: Option<String>,
    pub created_at: Ms,
}

// ── Subscriptions ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// One subscription per business, created at registration.
///
/// `trial_ends_at` stays set until the first payment activation clears
/// it; an expired record with it still set lapsed out of its trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Ms,
    pub current_period_end: Ms,
    pub trial_ends_at: Option<Ms>,
    pub cancel_at_period_end: bool,
    pub billing_ref: Option<String>,
}

impl Subscription {
    pub fn trial(registered_at: Ms, trial_ends_at: Ms) -> Self {
        Self {
            plan_id: "standard".to_string(),
            status: SubscriptionStatus::Trial,
            current_period_start: registered_at,
            current_period_end: trial_ends_at,
            trial_ends_at: Some(trial_ends_at),
            cancel_at_period_end: false,
            billing_ref: None,
        }
    }
}

// ── Business state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BusinessState {
    pub id: Ulid,
    pub name: Option<String>,
    pub registered_at: Ms,
    /// Index 0 = Sunday … 6 = Saturday. At most one window per weekday.
    pub hours: [Option<DayHours>; 7],
    pub services: HashMap<Ulid, ServiceRecord>,
    /// All bookings ever admitted, sorted by `span.start`. Never
    /// removed — terminal bookings are soft state via status.
    pub bookings: Vec<Booking>,
    pub subscription: Subscription,
}

impl BusinessState {
    pub fn new(id: Ulid, name: Option<String>, registered_at: Ms, trial_ends_at: Ms) -> Self {
        Self {
            id,
            name,
            registered_at,
            hours: [None; 7],
            services: HashMap::new(),
            bookings: Vec::new(),
            subscription: Subscription::trial(registered_at, trial_ends_at),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window. Binary search
    /// skips everything starting at or after `query.end`.
    pub fn bookings_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn service(&self, id: &Ulid) -> Option<&ServiceRecord> {
        self.services.get(id)
    }
}

// ── Journal events ───────────────────────────────────────────────

/// The event types — flat, no nesting. This is the journal record
/// format; replay must be deterministic from event plus prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessRegistered {
        id: Ulid,
        name: Option<String>,
        registered_at: Ms,
        trial_ends_at: Ms,
    },
    ServiceRegistered {
        id: Ulid,
        business_id: Ulid,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    },
    ServiceRetired {
        id: Ulid,
        business_id: Ulid,
    },
    WorkingHoursSet {
        business_id: Ulid,
        weekday: u8,
        start_minute: u16,
        end_minute: u16,
        active: bool,
    },
    WorkingHoursCleared {
        business_id: Ulid,
        weekday: u8,
    },
    WorkingHoursReplaced {
        business_id: Ulid,
        week: Vec<DaySchedule>,
    },
    BookingCreated {
        id: Ulid,
        business_id: Ulid,
        service_id: Ulid,
        customer_id: Option<Ulid>,
        span: Span,
        notes: Option<String>,
        created_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        business_id: Ulid,
        status: BookingStatus,
    },
    BookingPaid {
        id: Ulid,
        business_id: Ulid,
        method: String,
        reference: String,
    },
    SubscriptionActivated {
        business_id: Ulid,
        period_start: Ms,
        period_end: Ms,
        billing_ref: Option<String>,
    },
    SubscriptionCancelScheduled {
        business_id: Ulid,
    },
    SubscriptionCancelLifted {
        business_id: Ulid,
    },
    SubscriptionLapsed {
        business_id: Ulid,
    },
}

/// Extract the business_id from an event (for non-registration events).
pub fn event_business_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BusinessRegistered { .. } => None,
        Event::ServiceRegistered { business_id, .. }
        | Event::ServiceRetired { business_id, .. }
        | Event::WorkingHoursSet { business_id, .. }
        | Event::WorkingHoursCleared { business_id, .. }
        | Event::WorkingHoursReplaced { business_id, .. }
        | Event::BookingCreated { business_id, .. }
        | Event::BookingStatusChanged { business_id, .. }
        | Event::BookingPaid { business_id, .. }
        | Event::SubscriptionActivated { business_id, .. }
        | Event::SubscriptionCancelScheduled { business_id }
        | Event::SubscriptionCancelLifted { business_id }
        | Event::SubscriptionLapsed { business_id } => Some(*business_id),
    }
}

// ── Request identity ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// End customer or guest — never gated by the subscription check.
    Customer,
    /// Business staff — every gated request passes the access check.
    Owner,
}

/// Explicit request identity, threaded into every engine call that
/// needs authorization. There is no ambient request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub role: Role,
    pub actor: Option<Ulid>,
}

impl RequestContext {
    pub fn customer(actor: Option<Ulid>) -> Self {
        Self {
            role: Role::Customer,
            actor,
        }
    }

    pub fn owner() -> Self {
        Self {
            role: Role::Owner,
            actor: None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub business_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub is_paid: bool,
    pub payment_method: Option<String>,
    pub payment_ref: Option<String>,
}

impl BookingInfo {
    pub fn project(business_id: Ulid, b: &Booking) -> Self {
        Self {
            id: b.id,
            business_id,
            service_id: b.service_id,
            customer_id: b.customer_id,
            start: b.span.start,
            end: b.span.end,
            status: b.status,
            notes: b.notes.clone(),
            is_paid: b.is_paid,
            payment_method: b.payment_method.clone(),
            payment_ref: b.payment_ref.clone(),
        }
    }
}

/// A candidate slot. Derived on every query, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub start_minute: u16,
    pub end_minute: u16,
    pub available: bool,
}

impl SlotInfo {
    pub fn start_label(&self) -> String {
        minute_label(self.start_minute)
    }

    pub fn end_label(&self) -> String {
        minute_label(self.end_minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub business_id: Ulid,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Ms,
    pub current_period_end: Ms,
    pub trial_ends_at: Option<Ms>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionInfo {
    pub fn project(business_id: Ulid, s: &Subscription) -> Self {
        Self {
            business_id,
            plan_id: s.plan_id.clone(),
            status: s.status,
            current_period_start: s.current_period_start,
            current_period_end: s.current_period_end,
            trial_ends_at: s.trial_ends_at,
            cancel_at_period_end: s.cancel_at_period_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHoursInfo {
    pub business_id: Ulid,
    pub weekday: u8,
    pub start_minute: u16,
    pub end_minute: u16,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub business_id: Ulid,
    pub duration_minutes: u32,
    pub price_cents: i64,
    pub active: bool,
}
