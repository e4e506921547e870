mod conflict;
mod error;
pub mod gate;
mod mutations;
mod queries;
pub mod slots;
#[cfg(test)]
mod tests;

pub use error::{DenyReason, EngineError};
pub use gate::Access;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::journal::Journal;
use crate::limits::LOCK_WAIT_MS;
use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedBusinessState = Arc<RwLock<BusinessState>>;

// ── Group-commit journal channel ─────────────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_and_respond(journal: &mut Journal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    journal: &mut Journal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = journal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_compact_file(journal.path(), &events)
                .and_then(|()| journal.swap_compact_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedBusinessState>,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (service/booking) id → business id.
    pub(super) entity_to_business: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a BusinessState (no locking — caller
/// holds the lock). Registration is handled at the DashMap level.
fn apply_to_business(bs: &mut BusinessState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ServiceRegistered {
            id,
            business_id,
            duration_minutes,
            price_cents,
            active,
        } => {
            bs.services.insert(
                *id,
                ServiceRecord {
                    id: *id,
                    duration_minutes: *duration_minutes,
                    price_cents: *price_cents,
                    active: *active,
                },
            );
            entity_map.insert(*id, *business_id);
        }
        Event::ServiceRetired { id, .. } => {
            if let Some(service) = bs.services.get_mut(id) {
                service.active = false;
            }
        }
        Event::WorkingHoursSet {
            weekday,
            start_minute,
            end_minute,
            active,
            ..
        } => {
            if let Some(slot) = bs.hours.get_mut(*weekday as usize) {
                *slot = Some(DayHours {
                    start_minute: *start_minute,
                    end_minute: *end_minute,
                    active: *active,
                });
            }
        }
        Event::WorkingHoursCleared { weekday, .. } => {
            if let Some(slot) = bs.hours.get_mut(*weekday as usize) {
                *slot = None;
            }
        }
        Event::WorkingHoursReplaced { week, .. } => {
            bs.hours = [None; 7];
            for day in week {
                if let Some(slot) = bs.hours.get_mut(day.weekday as usize) {
                    *slot = Some(DayHours {
                        start_minute: day.start_minute,
                        end_minute: day.end_minute,
                        active: day.active,
                    });
                }
            }
        }
        Event::BookingCreated {
            id,
            business_id,
            service_id,
            customer_id,
            span,
            notes,
            created_at,
        } => {
            bs.insert_booking(Booking {
                id: *id,
                service_id: *service_id,
                customer_id: *customer_id,
                span: *span,
                status: BookingStatus::Pending,
                notes: notes.clone(),
                is_paid: false,
                payment_method: None,
                payment_ref: None,
                created_at: *created_at,
            });
            entity_map.insert(*id, *business_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = bs.booking_mut(id) {
                booking.status = *status;
            }
        }
        Event::BookingPaid {
            id,
            method,
            reference,
            ..
        } => {
            if let Some(booking) = bs.booking_mut(id) {
                booking.is_paid = true;
                booking.payment_method = Some(method.clone());
                booking.payment_ref = Some(reference.clone());
            }
        }
        Event::SubscriptionActivated {
            period_start,
            period_end,
            billing_ref,
            ..
        } => {
            gate::apply_activation(&mut bs.subscription, *period_start, *period_end);
            if billing_ref.is_some() {
                bs.subscription.billing_ref = billing_ref.clone();
            }
        }
        Event::SubscriptionCancelScheduled { .. } => {
            bs.subscription.cancel_at_period_end = true;
        }
        Event::SubscriptionCancelLifted { .. } => {
            bs.subscription.cancel_at_period_end = false;
        }
        Event::SubscriptionLapsed { .. } => {
            gate::apply_lapse(&mut bs.subscription);
        }
        // Registration is handled at the DashMap level, not here
        Event::BusinessRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(journal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let engine = Self {
            state: DashMap::new(),
            journal_tx,
            notify,
            entity_to_business: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use
        // blocking_write here because this may run inside an async context
        // (lazy tenant creation).
        for event in &events {
            match event {
                Event::BusinessRegistered {
                    id,
                    name,
                    registered_at,
                    trial_ends_at,
                } => {
                    let bs = BusinessState::new(*id, name.clone(), *registered_at, *trial_ends_at);
                    engine.state.insert(*id, Arc::new(RwLock::new(bs)));
                }
                other => {
                    if let Some(business_id) = event_business_id(other)
                        && let Some(entry) = engine.state.get(&business_id)
                    {
                        let bs_arc = entry.clone();
                        let mut guard = bs_arc.try_write().expect("replay: uncontended write");
                        apply_to_business(&mut guard, other, &engine.entity_to_business);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the journal via the background group-commit
    /// writer.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub fn get_business(&self, id: &Ulid) -> Option<SharedBusinessState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_business_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_business.get(entity_id).map(|e| *e.value())
    }

    /// Journal-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        business_id: Ulid,
        bs: &mut BusinessState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.journal_append(event).await?;
        apply_to_business(bs, event, &self.entity_to_business);
        self.notify.send(business_id, event);
        Ok(())
    }

    /// Acquire the business write lock with a bounded wait. Contention
    /// past the deadline surfaces as a retryable `Busy`, never an
    /// indefinite block.
    pub(super) async fn lock_business_write(
        &self,
        id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<BusinessState>, EngineError> {
        let bs = self.get_business(id).ok_or(EngineError::NotFound(*id))?;
        tokio::time::timeout(Duration::from_millis(LOCK_WAIT_MS), bs.write_owned())
            .await
            .map_err(|_| EngineError::Busy)
    }

    /// Lookup entity → business, then acquire the business write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<BusinessState>), EngineError> {
        let business_id = self
            .get_business_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_business_write(&business_id).await?;
        Ok((business_id, guard))
    }

    /// Compact the journal by rewriting it with only the events needed
    /// to recreate the current state.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let business_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in business_ids {
            let entry = match self.state.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let bs_arc = entry.value().clone();
            drop(entry);
            let guard = bs_arc.try_read().expect("compact: uncontended read");
            emit_business(&guard, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Emit the minimal event sequence that recreates one business.
fn emit_business(bs: &BusinessState, events: &mut Vec<Event>) {
    // Registration carries the original trial window; the subscription
    // events below bring the record back to its current shape.
    let trial_ends_at = bs
        .subscription
        .trial_ends_at
        .unwrap_or(bs.registered_at);
    events.push(Event::BusinessRegistered {
        id: bs.id,
        name: bs.name.clone(),
        registered_at: bs.registered_at,
        trial_ends_at,
    });

    for service in bs.services.values() {
        events.push(Event::ServiceRegistered {
            id: service.id,
            business_id: bs.id,
            duration_minutes: service.duration_minutes,
            price_cents: service.price_cents,
            active: service.active,
        });
    }

    for (weekday, hours) in bs.hours.iter().enumerate() {
        if let Some(h) = hours {
            events.push(Event::WorkingHoursSet {
                business_id: bs.id,
                weekday: weekday as u8,
                start_minute: h.start_minute,
                end_minute: h.end_minute,
                active: h.active,
            });
        }
    }

    for booking in &bs.bookings {
        events.push(Event::BookingCreated {
            id: booking.id,
            business_id: bs.id,
            service_id: booking.service_id,
            customer_id: booking.customer_id,
            span: booking.span,
            notes: booking.notes.clone(),
            created_at: booking.created_at,
        });
        if booking.status != BookingStatus::Pending {
            events.push(Event::BookingStatusChanged {
                id: booking.id,
                business_id: bs.id,
                status: booking.status,
            });
        }
        if booking.is_paid {
            events.push(Event::BookingPaid {
                id: booking.id,
                business_id: bs.id,
                method: booking.payment_method.clone().unwrap_or_default(),
                reference: booking.payment_ref.clone().unwrap_or_default(),
            });
        }
    }

    let sub = &bs.subscription;
    match sub.status {
        SubscriptionStatus::Trial => {
            if sub.cancel_at_period_end {
                events.push(Event::SubscriptionCancelScheduled { business_id: bs.id });
            }
        }
        SubscriptionStatus::Active => {
            events.push(Event::SubscriptionActivated {
                business_id: bs.id,
                period_start: sub.current_period_start,
                period_end: sub.current_period_end,
                billing_ref: sub.billing_ref.clone(),
            });
            if sub.cancel_at_period_end {
                events.push(Event::SubscriptionCancelScheduled { business_id: bs.id });
            }
        }
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
            // Replayed lapse needs the same period + flag shape first.
            if sub.trial_ends_at.is_none() {
                events.push(Event::SubscriptionActivated {
                    business_id: bs.id,
                    period_start: sub.current_period_start,
                    period_end: sub.current_period_end,
                    billing_ref: sub.billing_ref.clone(),
                });
            }
            if sub.cancel_at_period_end {
                events.push(Event::SubscriptionCancelScheduled { business_id: bs.id });
            }
            events.push(Event::SubscriptionLapsed { business_id: bs.id });
        }
    }
}
