use chrono::{Datelike, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::slots::generate_slots;
use super::{Engine, EngineError};

/// Midnight of a civil day in Ms. The platform is timezone-naive: civil
/// dates follow the business's local convention and are materialized as
/// UTC-naive millis.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// The civil day as a half-open span.
pub fn day_span(date: NaiveDate) -> Span {
    let start = day_start_ms(date);
    Span::new(start, start + MS_PER_DAY)
}

impl Engine {
    /// Compute the day's candidate slots for one service, marking each
    /// occupied when it overlaps a pending or confirmed booking. A day
    /// without active working hours yields an empty sequence — that is
    /// a valid outcome, not an error. The sequence is recomputed on
    /// every call and reflects the booking state read under this call's
    /// guard; it is never cached.
    pub async fn compute_slots(
        &self,
        business_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.read().await;

        let duration_minutes = match guard.service(&service_id) {
            Some(service) if service.active => service.duration_minutes,
            _ => return Err(EngineError::NotFound(service_id)),
        };

        let weekday = date.weekday().num_days_from_sunday() as usize;
        let hours = match guard.hours[weekday] {
            Some(h) if h.active => h,
            _ => return Ok(Vec::new()),
        };

        let window = day_span(date);
        let busy: Vec<Span> = guard
            .bookings_overlapping(&window)
            .filter(|b| b.status.blocks_slot())
            .map(|b| b.span)
            .collect();

        Ok(generate_slots(&hours, duration_minutes, &busy, window.start))
    }

    /// List a business's bookings, optionally restricted to one civil
    /// day, ascending by start time.
    pub async fn bookings_for(
        &self,
        business_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.read().await;

        let infos = match date {
            Some(date) => {
                let window = day_span(date);
                guard
                    .bookings_overlapping(&window)
                    .map(|b| BookingInfo::project(business_id, b))
                    .collect()
            }
            None => guard
                .bookings
                .iter()
                .map(|b| BookingInfo::project(business_id, b))
                .collect(),
        };
        Ok(infos)
    }

    /// List a business's services, registered and retired alike,
    /// ascending by id.
    pub async fn services_for(&self, business_id: Ulid) -> Result<Vec<ServiceInfo>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.read().await;

        let mut services: Vec<ServiceInfo> = guard
            .services
            .values()
            .map(|s| ServiceInfo {
                id: s.id,
                business_id,
                duration_minutes: s.duration_minutes,
                price_cents: s.price_cents,
                active: s.active,
            })
            .collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    pub async fn working_hours_for(
        &self,
        business_id: Ulid,
    ) -> Result<Vec<WorkingHoursInfo>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.read().await;

        Ok(guard
            .hours
            .iter()
            .enumerate()
            .filter_map(|(weekday, hours)| {
                hours.map(|h| WorkingHoursInfo {
                    business_id,
                    weekday: weekday as u8,
                    start_minute: h.start_minute,
                    end_minute: h.end_minute,
                    active: h.active,
                })
            })
            .collect())
    }

    /// Read the subscription, applying the lazy expiry rewrite first —
    /// the first read after a boundary pays for the transition.
    pub async fn current_subscription(
        &self,
        business_id: Ulid,
    ) -> Result<SubscriptionInfo, EngineError> {
        self.sync_subscription_status(business_id).await
    }
}
