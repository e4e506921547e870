use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use super::queries::day_start_ms;
use super::*;
use crate::model::*;
use crate::notify::NotifyHub;

const M: Ms = 60_000; // 1 minute in ms

fn test_journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_journal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn owner() -> RequestContext {
    RequestContext::owner()
}

fn customer(id: Ulid) -> RequestContext {
    RequestContext::customer(Some(id))
}

fn monday() -> NaiveDate {
    // 2025-11-17 is a Monday.
    NaiveDate::from_ymd_opt(2025, 11, 17).unwrap()
}

/// Absolute span for a slot on `date` starting at `start_minute`.
fn slot_span(date: NaiveDate, start_minute: u16, duration_minutes: u32) -> Span {
    let day = day_start_ms(date);
    let start = day + start_minute as Ms * M;
    Span::new(start, start + duration_minutes as Ms * M)
}

/// Engine with one business, one service, Monday 09:00–18:00.
async fn salon(name: &str, duration_minutes: u32) -> (Engine, Ulid, Ulid) {
    let engine = new_engine(name);
    let business = Ulid::new();
    engine
        .register_business(business, Some("Corte Fino".into()))
        .await
        .unwrap();
    let service = Ulid::new();
    engine
        .register_service(&owner(), service, business, duration_minutes, 5_000, true)
        .await
        .unwrap();
    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
        .await
        .unwrap();
    (engine, business, service)
}

/// Push a business's subscription boundary into the past so the next
/// read observes a stale-live record.
async fn force_boundary_past(engine: &Engine, business: Ulid) {
    let bs = engine.get_business(&business).unwrap();
    let mut guard = bs.write().await;
    let past = super::conflict::now_ms() - 10_000;
    guard.subscription.current_period_end = past;
    if guard.subscription.trial_ends_at.is_some() {
        guard.subscription.trial_ends_at = Some(past);
    }
}

// ── Registry ─────────────────────────────────────────────────

#[tokio::test]
async fn register_business_starts_trial() {
    let engine = new_engine("register_trial.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trial);
    assert_eq!(
        sub.current_period_end - sub.current_period_start,
        crate::limits::TRIAL_PERIOD_MS
    );
    assert_eq!(sub.trial_ends_at, Some(sub.current_period_end));
    assert!(!sub.cancel_at_period_end);
}

#[tokio::test]
async fn duplicate_business_rejected() {
    let engine = new_engine("dup_business.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();
    let result = engine.register_business(business, None).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn service_duration_below_minimum_rejected() {
    let engine = new_engine("short_service.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();
    let result = engine
        .register_service(&owner(), Ulid::new(), business, 4, 1_000, true)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn retired_service_vanishes_from_public_surface() {
    let (engine, business, service) = salon("retire_service.journal", 30).await;
    engine.retire_service(&owner(), service).await.unwrap();

    let result = engine.compute_slots(business, service, monday()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    let span = slot_span(monday(), 9 * 60, 30);
    let result = engine
        .create_booking(&owner(), Ulid::new(), business, service, None, span, None)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));

    // Retiring again is a quiet no-op
    engine.retire_service(&owner(), service).await.unwrap();
}

// ── Working hours ────────────────────────────────────────────

#[tokio::test]
async fn working_hours_validation() {
    let engine = new_engine("hours_validation.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    // start >= end
    let r = engine
        .set_working_hours(&owner(), business, 1, 600, 600, true)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidArgument(_))));

    // active span under an hour
    let r = engine
        .set_working_hours(&owner(), business, 1, 600, 630, true)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidArgument(_))));

    // an inactive record may be shorter
    engine
        .set_working_hours(&owner(), business, 1, 600, 630, false)
        .await
        .unwrap();

    // weekday out of range
    let r = engine
        .set_working_hours(&owner(), business, 7, 540, 1080, true)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidArgument(_))));

    // end past midnight
    let r = engine
        .set_working_hours(&owner(), business, 1, 540, 1441, true)
        .await;
    assert!(matches!(r, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn working_hours_upsert_keeps_one_record_per_weekday() {
    let engine = new_engine("hours_upsert.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
        .await
        .unwrap();
    engine
        .set_working_hours(&owner(), business, 1, 10 * 60, 16 * 60, true)
        .await
        .unwrap();

    let hours = engine.working_hours_for(business).await.unwrap();
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].weekday, 1);
    assert_eq!(hours[0].start_minute, 10 * 60);
    assert_eq!(hours[0].end_minute, 16 * 60);
}

#[tokio::test]
async fn replace_working_hours_drops_previous_week() {
    let engine = new_engine("hours_replace.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
        .await
        .unwrap();
    engine
        .set_working_hours(&owner(), business, 2, 9 * 60, 18 * 60, true)
        .await
        .unwrap();

    engine
        .replace_working_hours(
            &owner(),
            business,
            vec![DaySchedule {
                weekday: 3,
                start_minute: 8 * 60,
                end_minute: 14 * 60,
                active: true,
            }],
        )
        .await
        .unwrap();

    let hours = engine.working_hours_for(business).await.unwrap();
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].weekday, 3);
}

#[tokio::test]
async fn replace_working_hours_rejects_duplicate_weekday() {
    let engine = new_engine("hours_dup_weekday.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    let day = DaySchedule {
        weekday: 1,
        start_minute: 9 * 60,
        end_minute: 18 * 60,
        active: true,
    };
    let result = engine
        .replace_working_hours(&owner(), business, vec![day, day])
        .await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn clear_working_hours_is_noop_when_absent() {
    let engine = new_engine("hours_clear.journal");
    let business = Ulid::new();
    engine.register_business(business, None).await.unwrap();

    engine
        .clear_working_hours(&owner(), business, 1)
        .await
        .unwrap();

    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
        .await
        .unwrap();
    engine
        .clear_working_hours(&owner(), business, 1)
        .await
        .unwrap();
    assert!(engine.working_hours_for(business).await.unwrap().is_empty());
}

// ── Slot generation ──────────────────────────────────────────

#[tokio::test]
async fn full_day_of_half_hour_slots() {
    let (engine, business, service) = salon("full_day_slots.journal", 30).await;

    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    assert_eq!(slots.len(), 18);
    assert_eq!(slots[0].start_label(), "09:00");
    assert_eq!(slots[17].start_label(), "17:30");
    assert!(slots.iter().all(|s| s.available));

    // Ascending by start
    for pair in slots.windows(2) {
        assert!(pair[0].start_minute < pair[1].start_minute);
    }
}

#[tokio::test]
async fn booked_slot_flips_unavailable_others_unchanged() {
    let (engine, business, service) = salon("booked_slot.journal", 30).await;

    let span = slot_span(monday(), 9 * 60, 30);
    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            span,
            None,
        )
        .await
        .unwrap();

    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    assert_eq!(slots.len(), 18);
    assert!(!slots[0].available);
    assert!(slots[1..].iter().all(|s| s.available));
}

#[tokio::test]
async fn day_without_hours_yields_empty_not_error() {
    let (engine, business, service) = salon("no_hours_day.journal", 30).await;
    // 2025-11-18 is a Tuesday — no working hours configured.
    let tuesday = NaiveDate::from_ymd_opt(2025, 11, 18).unwrap();
    let slots = engine
        .compute_slots(business, service, tuesday)
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn inactive_day_yields_empty() {
    let (engine, business, service) = salon("inactive_day.journal", 30).await;
    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, false)
        .await
        .unwrap();
    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    assert!(slots.is_empty());
}

#[tokio::test]
async fn unknown_service_fails_slot_query() {
    let (engine, business, _service) = salon("unknown_service.journal", 30).await;
    let result = engine.compute_slots(business, Ulid::new(), monday()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn slots_reflect_other_services_bookings() {
    // A booking made through one service occupies the calendar for all
    // of the business's services.
    let (engine, business, short) = salon("cross_service.journal", 30).await;
    let long = Ulid::new();
    engine
        .register_service(&owner(), long, business, 90, 12_000, true)
        .await
        .unwrap();

    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            short,
            None,
            slot_span(monday(), 10 * 60, 30),
            None,
        )
        .await
        .unwrap();

    let slots = engine.compute_slots(business, long, monday()).await.unwrap();
    // Every 90-minute candidate reaching into 10:00–10:30 is blocked.
    let blocked: Vec<String> = slots
        .iter()
        .filter(|s| !s.available)
        .map(|s| s.start_label())
        .collect();
    assert_eq!(blocked, vec!["09:00", "09:30", "10:00"]);
}

// ── Booking admission ────────────────────────────────────────

#[tokio::test]
async fn available_slot_books_then_conflicts() {
    let (engine, business, service) = salon("slot_consistency.journal", 30).await;

    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    let first = slots.iter().find(|s| s.available).unwrap();
    let span = slot_span(monday(), first.start_minute, 30);

    // An available slot admits a booking...
    let info = engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            span,
            None,
        )
        .await
        .unwrap();
    assert_eq!(info.status, BookingStatus::Pending);
    assert_eq!(info.start, span.start);

    // ...and the identical window now conflicts.
    let result = engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            span,
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn partial_overlap_conflicts_adjacent_admits() {
    let (engine, business, service) = salon("partial_overlap.journal", 60).await;

    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 10 * 60, 60),
            None,
        )
        .await
        .unwrap();

    // Overlapping by half an hour
    let result = engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 10 * 60 + 30, 60),
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    // Back-to-back is fine
    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 11 * 60, 60),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, business, service) = salon("dup_booking.journal", 30).await;
    let id = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();
    let result = engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 14 * 60, 30),
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn no_double_booking_under_concurrency() {
    let (engine, business, service) = salon("concurrent_admission.journal", 30).await;
    let engine = Arc::new(engine);
    let span = slot_span(monday(), 9 * 60, 30);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(
                    &RequestContext::customer(None),
                    Ulid::new(),
                    business,
                    service,
                    None,
                    span,
                    None,
                )
                .await
        }));
    }

    let mut admitted = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);

    // The invariant holds in the store as well
    let bookings = engine.bookings_for(business, Some(monday())).await.unwrap();
    let live: Vec<_> = bookings.iter().filter(|b| b.status.blocks_slot()).collect();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn concurrent_disjoint_windows_all_admit() {
    let (engine, business, service) = salon("concurrent_disjoint.journal", 30).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..8u16 {
        let engine = engine.clone();
        let span = slot_span(monday(), 9 * 60 + i * 30, 30);
        handles.push(tokio::spawn(async move {
            engine
                .create_booking(
                    &RequestContext::customer(None),
                    Ulid::new(),
                    business,
                    service,
                    None,
                    span,
                    None,
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let bookings = engine.bookings_for(business, Some(monday())).await.unwrap();
    assert_eq!(bookings.len(), 8);
}

#[tokio::test(start_paused = true)]
async fn contended_lock_times_out_as_busy() {
    let (engine, business, service) = salon("lock_busy.journal", 30).await;

    // Hold the business write lock across the admission attempt.
    let bs = engine.get_business(&business).unwrap();
    let _guard = bs.write_owned().await;

    let result = engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Busy)));
}

// ── Status transitions ───────────────────────────────────────

#[tokio::test]
async fn owner_confirms_then_completes() {
    let (engine, business, service) = salon("confirm_complete.journal", 30).await;
    let id = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    let info = engine
        .set_booking_status(&owner(), id, BookingStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(info.status, BookingStatus::Confirmed);

    let info = engine
        .set_booking_status(&owner(), id, BookingStatus::Completed)
        .await
        .unwrap();
    assert_eq!(info.status, BookingStatus::Completed);
}

#[tokio::test]
async fn customer_cancels_own_booking_only() {
    let (engine, business, service) = salon("customer_cancel.journal", 30).await;
    let alice = Ulid::new();
    let mallory = Ulid::new();
    let id = Ulid::new();
    engine
        .create_booking(
            &customer(alice),
            id,
            business,
            service,
            Some(alice),
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    let result = engine
        .set_booking_status(&customer(mallory), id, BookingStatus::Cancelled)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    let info = engine
        .set_booking_status(&customer(alice), id, BookingStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(info.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn customer_cannot_complete_or_no_show() {
    let (engine, business, service) = salon("customer_complete.journal", 30).await;
    let alice = Ulid::new();
    let id = Ulid::new();
    engine
        .create_booking(
            &customer(alice),
            id,
            business,
            service,
            Some(alice),
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    for status in [BookingStatus::Completed, BookingStatus::NoShow] {
        let result = engine
            .set_booking_status(&customer(alice), id, status)
            .await;
        assert!(matches!(result, Err(EngineError::Forbidden(_))));
    }
}

#[tokio::test]
async fn guest_booking_cancel_requires_owner() {
    let (engine, business, service) = salon("guest_cancel.journal", 30).await;
    let id = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    // No customer owns a guest booking
    let result = engine
        .set_booking_status(&customer(Ulid::new()), id, BookingStatus::Cancelled)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));

    engine
        .set_booking_status(&owner(), id, BookingStatus::Cancelled)
        .await
        .unwrap();
}

#[tokio::test]
async fn terminal_states_reject_further_transitions() {
    let (engine, business, service) = salon("terminal_guard.journal", 30).await;
    let alice = Ulid::new();
    let id = Ulid::new();
    engine
        .create_booking(
            &customer(alice),
            id,
            business,
            service,
            Some(alice),
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    engine
        .set_booking_status(&customer(alice), id, BookingStatus::Cancelled)
        .await
        .unwrap();

    // Cancelling a cancelled booking is InvalidState and mutates nothing
    let result = engine
        .set_booking_status(&customer(alice), id, BookingStatus::Cancelled)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));

    let result = engine
        .set_booking_status(&owner(), id, BookingStatus::Completed)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState { .. })));

    let bookings = engine.bookings_for(business, None).await.unwrap();
    assert_eq!(bookings[0].status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn cancelled_booking_frees_its_window() {
    let (engine, business, service) = salon("cancel_frees.journal", 30).await;
    let alice = Ulid::new();
    let id = Ulid::new();
    let span = slot_span(monday(), 9 * 60, 30);
    engine
        .create_booking(&customer(alice), id, business, service, Some(alice), span, None)
        .await
        .unwrap();
    engine
        .set_booking_status(&customer(alice), id, BookingStatus::Cancelled)
        .await
        .unwrap();

    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    assert!(slots[0].available);

    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            span,
            None,
        )
        .await
        .unwrap();
}

// ── Payment callback ─────────────────────────────────────────

#[tokio::test]
async fn payment_confirmation_is_idempotent() {
    let (engine, business, service) = salon("payment_idempotent.journal", 30).await;
    let id = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();

    let info = engine
        .confirm_payment(id, "card".into(), "pay_1".into())
        .await
        .unwrap();
    assert!(info.is_paid);
    assert_eq!(info.payment_method.as_deref(), Some("card"));
    assert_eq!(info.payment_ref.as_deref(), Some("pay_1"));

    // A repeated callback is a no-op success, not an error — and it
    // does not overwrite the recorded reference.
    let info = engine
        .confirm_payment(id, "pix".into(), "pay_2".into())
        .await
        .unwrap();
    assert!(info.is_paid);
    assert_eq!(info.payment_method.as_deref(), Some("card"));
    assert_eq!(info.payment_ref.as_deref(), Some("pay_1"));
}

#[tokio::test]
async fn payment_for_unknown_booking_fails() {
    let (engine, _business, _service) = salon("payment_unknown.journal", 30).await;
    let result = engine
        .confirm_payment(Ulid::new(), "card".into(), "pay_1".into())
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Subscription gate ────────────────────────────────────────

#[tokio::test]
async fn trial_expiry_is_lazy_and_persistent() {
    let (engine, business, _service) = salon("lazy_expiry.journal", 30).await;
    force_boundary_past(&engine, business).await;

    // An owner mutation is denied and the stored status flips
    let result = engine
        .set_working_hours(&owner(), business, 2, 9 * 60, 18 * 60, true)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Denied(DenyReason::TrialExpired))
    ));

    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn subscription_read_triggers_the_rewrite() {
    let (engine, business, _service) = salon("read_rewrite.journal", 30).await;
    force_boundary_past(&engine, business).await;

    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);

    // Stored, not just projected
    let bs = engine.get_business(&business).unwrap();
    assert_eq!(
        bs.read().await.subscription.status,
        SubscriptionStatus::Expired
    );
}

#[tokio::test]
async fn expired_owner_is_denied_but_customers_pass() {
    let (engine, business, service) = salon("customers_pass.journal", 30).await;
    force_boundary_past(&engine, business).await;

    // Owner-gated operation fails...
    let result = engine
        .register_service(&owner(), Ulid::new(), business, 45, 8_000, true)
        .await;
    assert!(matches!(result, Err(EngineError::Denied(_))));

    // ...but the public booking path is untouched
    engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn payment_reactivates_expired_subscription() {
    let (engine, business, _service) = salon("payment_reactivates.journal", 30).await;
    force_boundary_past(&engine, business).await;
    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);

    let sub = engine.activate_subscription(business, None).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.trial_ends_at, None);
    assert_eq!(
        sub.current_period_end - sub.current_period_start,
        crate::limits::BILLING_PERIOD_MS
    );

    // Gated operations work again
    engine
        .set_working_hours(&owner(), business, 2, 9 * 60, 18 * 60, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_keeps_access_until_period_end() {
    let (engine, business, _service) = salon("cancel_until_end.journal", 30).await;
    engine.activate_subscription(business, None).await.unwrap();

    let sub = engine.cancel_subscription(&owner(), business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.cancel_at_period_end);

    // Still inside the period: owner operations pass
    engine
        .set_working_hours(&owner(), business, 2, 9 * 60, 18 * 60, true)
        .await
        .unwrap();

    // Past the period: the lapse resolves to Cancelled
    force_boundary_past(&engine, business).await;
    let result = engine
        .set_working_hours(&owner(), business, 3, 9 * 60, 18 * 60, true)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Denied(DenyReason::Cancelled))
    ));
    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn reactivate_lifts_scheduled_cancel() {
    let (engine, business, _service) = salon("reactivate.journal", 30).await;
    engine.activate_subscription(business, None).await.unwrap();
    engine.cancel_subscription(&owner(), business).await.unwrap();

    let sub = engine
        .reactivate_subscription(&owner(), business)
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(!sub.cancel_at_period_end);

    // Nothing scheduled now
    let result = engine.reactivate_subscription(&owner(), business).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

#[tokio::test]
async fn activation_records_the_billing_reference() {
    let (engine, business, _service) = salon("billing_ref.journal", 30).await;
    engine
        .activate_subscription(business, Some("sub_42".into()))
        .await
        .unwrap();

    let bs = engine.get_business(&business).unwrap();
    assert_eq!(
        bs.read().await.subscription.billing_ref.as_deref(),
        Some("sub_42")
    );

    // A renewal without a reference keeps the recorded one
    engine.activate_subscription(business, None).await.unwrap();
    assert_eq!(
        bs.read().await.subscription.billing_ref.as_deref(),
        Some("sub_42")
    );
}

#[tokio::test]
async fn services_listing_includes_retired() {
    let (engine, business, service) = salon("services_listing.journal", 30).await;
    let second = Ulid::new();
    engine
        .register_service(&owner(), second, business, 60, 9_000, true)
        .await
        .unwrap();
    engine.retire_service(&owner(), service).await.unwrap();

    let services = engine.services_for(business).await.unwrap();
    assert_eq!(services.len(), 2);
    let retired = services.iter().find(|s| s.id == service).unwrap();
    assert!(!retired.active);
    let live = services.iter().find(|s| s.id == second).unwrap();
    assert!(live.active);
    assert_eq!(live.price_cents, 9_000);
}

#[tokio::test]
async fn cancel_requires_active_subscription() {
    let (engine, business, _service) = salon("cancel_needs_active.journal", 30).await;
    // Still trialing
    let result = engine.cancel_subscription(&owner(), business).await;
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
}

// ── Notifications ────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_emits_notices() {
    let (engine, business, service) = salon("notices.journal", 30).await;
    let mut rx = engine.notify.subscribe(business);

    let id = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            id,
            business,
            service,
            None,
            slot_span(monday(), 9 * 60, 30),
            None,
        )
        .await
        .unwrap();
    engine
        .confirm_payment(id, "card".into(), "pay_1".into())
        .await
        .unwrap();
    engine
        .set_booking_status(&owner(), id, BookingStatus::Cancelled)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().kind, "booking_created");
    assert_eq!(rx.recv().await.unwrap().kind, "payment_confirmed");
    assert_eq!(rx.recv().await.unwrap().kind, "booking_status_changed");
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_engine_state() {
    let path = test_journal_path("replay_rebuild.journal");
    let business = Ulid::new();
    let service = Ulid::new();
    let booking = Ulid::new();
    let alice = Ulid::new();

    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine
            .register_business(business, Some("Corte Fino".into()))
            .await
            .unwrap();
        engine
            .register_service(&owner(), service, business, 30, 5_000, true)
            .await
            .unwrap();
        engine
            .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
            .await
            .unwrap();
        engine
            .create_booking(
                &customer(alice),
                booking,
                business,
                service,
                Some(alice),
                slot_span(monday(), 10 * 60, 30),
                Some("first visit".into()),
            )
            .await
            .unwrap();
        engine
            .set_booking_status(&owner(), booking, BookingStatus::Confirmed)
            .await
            .unwrap();
        engine
            .confirm_payment(booking, "card".into(), "pay_1".into())
            .await
            .unwrap();
        engine.activate_subscription(business, None).await.unwrap();
    }

    // A fresh engine over the same journal sees identical state
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let bookings = engine.bookings_for(business, None).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, booking);
    assert_eq!(bookings[0].status, BookingStatus::Confirmed);
    assert!(bookings[0].is_paid);
    assert_eq!(bookings[0].customer_id, Some(alice));
    assert_eq!(bookings[0].notes.as_deref(), Some("first visit"));

    let hours = engine.working_hours_for(business).await.unwrap();
    assert_eq!(hours.len(), 1);

    let sub = engine.current_subscription(business).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);

    // The booked window still conflicts after recovery
    let result = engine
        .create_booking(
            &RequestContext::customer(None),
            Ulid::new(),
            business,
            service,
            None,
            slot_span(monday(), 10 * 60, 30),
            None,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn compaction_preserves_projections() {
    let path = test_journal_path("compact_preserve.journal");
    let business = Ulid::new();
    let service = Ulid::new();
    let alice = Ulid::new();

    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    engine.register_business(business, None).await.unwrap();
    engine
        .register_service(&owner(), service, business, 30, 5_000, true)
        .await
        .unwrap();
    engine
        .set_working_hours(&owner(), business, 1, 9 * 60, 18 * 60, true)
        .await
        .unwrap();

    // Churn: book and cancel repeatedly, then one surviving booking
    for i in 0..5u16 {
        let id = Ulid::new();
        engine
            .create_booking(
                &customer(alice),
                id,
                business,
                service,
                Some(alice),
                slot_span(monday(), 9 * 60 + i * 30, 30),
                None,
            )
            .await
            .unwrap();
        engine
            .set_booking_status(&customer(alice), id, BookingStatus::Cancelled)
            .await
            .unwrap();
    }
    let keeper = Ulid::new();
    engine
        .create_booking(
            &RequestContext::customer(None),
            keeper,
            business,
            service,
            None,
            slot_span(monday(), 15 * 60, 30),
            None,
        )
        .await
        .unwrap();

    let before = engine.bookings_for(business, None).await.unwrap();
    engine.compact_journal().await.unwrap();
    drop(engine);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let after = engine.bookings_for(business, None).await.unwrap();
    assert_eq!(before, after);

    let slots = engine
        .compute_slots(business, service, monday())
        .await
        .unwrap();
    let unavailable: Vec<String> = slots
        .iter()
        .filter(|s| !s.available)
        .map(|s| s.start_label())
        .collect();
    assert_eq!(unavailable, vec!["15:00"]);
}
