use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, gate};

fn validate_day_window(
    weekday: u8,
    start_minute: u16,
    end_minute: u16,
    active: bool,
) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::InvalidArgument("weekday must be 0..=6"));
    }
    if end_minute > MINUTES_PER_DAY {
        return Err(EngineError::InvalidArgument("end past midnight"));
    }
    if start_minute >= end_minute {
        return Err(EngineError::InvalidArgument(
            "working hours start must be before end",
        ));
    }
    if active && end_minute - start_minute < MIN_WORKING_SPAN_MINUTES {
        return Err(EngineError::InvalidArgument(
            "active working hours must span at least an hour",
        ));
    }
    Ok(())
}

impl Engine {
    /// Run the lazy expiry rewrite if the stored subscription status has
    /// gone stale. This is the one engine write that happens on a read
    /// path — named, journaled, and logged.
    pub(super) async fn sync_subscription_locked(
        &self,
        business_id: Ulid,
        bs: &mut BusinessState,
    ) -> Result<(), EngineError> {
        if gate::lapse_due(&bs.subscription, now_ms()) {
            let event = Event::SubscriptionLapsed { business_id };
            self.persist_and_apply(business_id, bs, &event).await?;
            info!(
                "subscription for {business_id} lapsed to {}",
                bs.subscription.status.as_str()
            );
        }
        Ok(())
    }

    /// The access gate. Non-owner roles always pass; owner-role requests
    /// are admitted only while the subscription is live, syncing the
    /// stored status first.
    pub(super) async fn check_access_locked(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
        bs: &mut BusinessState,
    ) -> Result<(), EngineError> {
        if ctx.role != Role::Owner {
            return Ok(());
        }
        self.sync_subscription_locked(business_id, bs).await?;
        match gate::evaluate(&bs.subscription, now_ms()) {
            gate::Access::Allow => Ok(()),
            gate::Access::Deny(reason) => Err(EngineError::Denied(reason)),
        }
    }

    // ── Registry ─────────────────────────────────────────────

    pub async fn register_business(
        &self,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_BUSINESSES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("business name too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = now_ms();
        let trial_ends_at = now + TRIAL_PERIOD_MS;
        let event = Event::BusinessRegistered {
            id,
            name: name.clone(),
            registered_at: now,
            trial_ends_at,
        };
        self.journal_append(&event).await?;
        let bs = BusinessState::new(id, name, now, trial_ends_at);
        self.state.insert(id, Arc::new(RwLock::new(bs)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn register_service(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        business_id: Ulid,
        duration_minutes: u32,
        price_cents: i64,
        active: bool,
    ) -> Result<(), EngineError> {
        if duration_minutes < MIN_SERVICE_DURATION_MINUTES {
            return Err(EngineError::InvalidArgument(
                "service duration below minimum",
            ));
        }
        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;
        if guard.services.len() >= MAX_SERVICES_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if guard.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceRegistered {
            id,
            business_id,
            duration_minutes,
            price_cents,
            active,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    /// Soft-deactivate a service. Already-retired services are left
    /// untouched (no journal churn).
    pub async fn retire_service(
        &self,
        ctx: &RequestContext,
        id: Ulid,
    ) -> Result<(), EngineError> {
        let (business_id, mut guard) = self.resolve_entity_write(&id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;
        let service = guard.service(&id).ok_or(EngineError::NotFound(id))?;
        if !service.active {
            return Ok(());
        }
        let event = Event::ServiceRetired { id, business_id };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    // ── Working hours ────────────────────────────────────────

    /// Upsert one weekday's window. At most one record per
    /// (business, weekday) by construction.
    pub async fn set_working_hours(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
        weekday: u8,
        start_minute: u16,
        end_minute: u16,
        active: bool,
    ) -> Result<(), EngineError> {
        validate_day_window(weekday, start_minute, end_minute, active)?;
        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;

        let event = Event::WorkingHoursSet {
            business_id,
            weekday,
            start_minute,
            end_minute,
            active,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    /// Bulk replace of the whole week: the previous schedule is dropped
    /// and recreated from `week` in one journaled event, so the swap is
    /// atomic by construction.
    pub async fn replace_working_hours(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
        week: Vec<DaySchedule>,
    ) -> Result<(), EngineError> {
        let mut seen = [false; 7];
        for day in &week {
            validate_day_window(day.weekday, day.start_minute, day.end_minute, day.active)?;
            let slot = &mut seen[day.weekday as usize];
            if *slot {
                return Err(EngineError::InvalidArgument(
                    "duplicate weekday in schedule",
                ));
            }
            *slot = true;
        }

        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;

        let event = Event::WorkingHoursReplaced { business_id, week };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    /// Remove one weekday's record. Clearing an absent weekday is a
    /// no-op, as with any DELETE matching zero rows.
    pub async fn clear_working_hours(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
        weekday: u8,
    ) -> Result<(), EngineError> {
        if weekday > 6 {
            return Err(EngineError::InvalidArgument("weekday must be 0..=6"));
        }
        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;
        if guard.hours[weekday as usize].is_none() {
            return Ok(());
        }

        let event = Event::WorkingHoursCleared {
            business_id,
            weekday,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    // ── Booking admission ────────────────────────────────────

    /// Admit a booking if its window is free. The conflict check and
    /// the insert run under one business write lock, so two concurrent
    /// requests for overlapping windows serialize and the loser gets
    /// `Conflict`. The engine trusts the caller-supplied window — it
    /// does not recompute the duration from the service.
    pub async fn create_booking(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        business_id: Ulid,
        service_id: Ulid,
        customer_id: Option<Ulid>,
        span: Span,
        notes: Option<String>,
    ) -> Result<BookingInfo, EngineError> {
        validate_span(&span)?;
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let mut guard = self.lock_business_write(&business_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if guard.booking(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        match guard.service(&service_id) {
            Some(service) if service.active => {}
            _ => return Err(EngineError::NotFound(service_id)),
        }

        check_no_conflict(&guard, &span)?;

        let customer_id = customer_id.or(ctx.actor);
        let event = Event::BookingCreated {
            id,
            business_id,
            service_id,
            customer_id,
            span,
            notes,
            created_at: now_ms(),
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;

        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingInfo::project(business_id, booking))
    }

    /// Apply one status transition. Cancellation is open to the booking's
    /// customer and to the owner role (guest bookings have no customer
    /// who could cancel); every other transition is owner-only. Owner
    /// requests pass the access gate.
    pub async fn set_booking_status(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        new_status: BookingStatus,
    ) -> Result<BookingInfo, EngineError> {
        let (business_id, mut guard) = self.resolve_entity_write(&id).await?;

        match (ctx.role, new_status) {
            (Role::Owner, _) => {
                self.check_access_locked(ctx, business_id, &mut guard).await?;
            }
            (Role::Customer, BookingStatus::Cancelled) => {
                let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
                if booking.customer_id.is_none() || booking.customer_id != ctx.actor {
                    return Err(EngineError::Forbidden(
                        "only the booking's customer may cancel it",
                    ));
                }
            }
            (Role::Customer, _) => {
                return Err(EngineError::Forbidden(
                    "status change is restricted to business staff",
                ));
            }
        }

        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.status.can_transition_to(new_status) {
            return Err(EngineError::InvalidState {
                from: booking.status,
                to: new_status,
            });
        }

        let event = Event::BookingStatusChanged {
            id,
            business_id,
            status: new_status,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;

        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingInfo::project(business_id, booking))
    }

    /// Payment-confirmed callback from the billing collaborator.
    /// Idempotent: a repeat call for an already-paid booking succeeds
    /// without writing anything.
    pub async fn confirm_payment(
        &self,
        id: Ulid,
        method: String,
        reference: String,
    ) -> Result<BookingInfo, EngineError> {
        if method.len() > MAX_PAYMENT_FIELD_LEN || reference.len() > MAX_PAYMENT_FIELD_LEN {
            return Err(EngineError::LimitExceeded("payment field too long"));
        }
        let (business_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.is_paid {
            return Ok(BookingInfo::project(business_id, booking));
        }

        let event = Event::BookingPaid {
            id,
            business_id,
            method,
            reference,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;

        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingInfo::project(business_id, booking))
    }

    // ── Subscription commands ────────────────────────────────

    /// The named form of the lazy expiry rewrite (also invoked by every
    /// subscription read).
    pub async fn sync_subscription_status(
        &self,
        business_id: Ulid,
    ) -> Result<SubscriptionInfo, EngineError> {
        let mut guard = self.lock_business_write(&business_id).await?;
        self.sync_subscription_locked(business_id, &mut guard).await?;
        Ok(SubscriptionInfo::project(business_id, &guard.subscription))
    }

    /// Owner cancellation: schedules the cancel at the period boundary.
    /// Status stays `Active` and access continues until the period ends;
    /// the lazy sync then lapses the record to `Cancelled`.
    pub async fn cancel_subscription(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
    ) -> Result<SubscriptionInfo, EngineError> {
        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;
        if guard.subscription.status != SubscriptionStatus::Active {
            return Err(EngineError::InvalidArgument(
                "only an active subscription can be cancelled",
            ));
        }
        if !guard.subscription.cancel_at_period_end {
            let event = Event::SubscriptionCancelScheduled { business_id };
            self.persist_and_apply(business_id, &mut guard, &event).await?;
        }
        Ok(SubscriptionInfo::project(business_id, &guard.subscription))
    }

    /// Owner reactivation: lifts a scheduled cancel before the boundary.
    pub async fn reactivate_subscription(
        &self,
        ctx: &RequestContext,
        business_id: Ulid,
    ) -> Result<SubscriptionInfo, EngineError> {
        let mut guard = self.lock_business_write(&business_id).await?;
        self.check_access_locked(ctx, business_id, &mut guard).await?;
        if !guard.subscription.cancel_at_period_end {
            return Err(EngineError::InvalidArgument("no cancellation scheduled"));
        }
        let event = Event::SubscriptionCancelLifted { business_id };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        Ok(SubscriptionInfo::project(business_id, &guard.subscription))
    }

    /// Payment-confirmed activation from the billing collaborator: a
    /// fresh one-month period from now, from any prior status. Not
    /// gated — this is how a lapsed business comes back.
    pub async fn activate_subscription(
        &self,
        business_id: Ulid,
        billing_ref: Option<String>,
    ) -> Result<SubscriptionInfo, EngineError> {
        if let Some(ref r) = billing_ref
            && r.len() > MAX_PAYMENT_FIELD_LEN
        {
            return Err(EngineError::LimitExceeded("billing reference too long"));
        }
        let mut guard = self.lock_business_write(&business_id).await?;
        let now = now_ms();
        let event = Event::SubscriptionActivated {
            business_id,
            period_start: now,
            period_end: now + BILLING_PERIOD_MS,
            billing_ref,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        Ok(SubscriptionInfo::project(business_id, &guard.subscription))
    }
}
