use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// What subscribers receive: the event kind plus its JSON form — the
/// textual payload a delivery collaborator (mail, push, webhook) would
/// relay. Delivery itself is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub business_id: Ulid,
    pub kind: &'static str,
    pub payload: String,
}

fn event_kind(event: &Event) -> &'static str {
    match event {
        Event::BusinessRegistered { .. } => "business_registered",
        Event::ServiceRegistered { .. } => "service_registered",
        Event::ServiceRetired { .. } => "service_retired",
        Event::WorkingHoursSet { .. }
        | Event::WorkingHoursCleared { .. }
        | Event::WorkingHoursReplaced { .. } => "working_hours_changed",
        Event::BookingCreated { .. } => "booking_created",
        Event::BookingStatusChanged { .. } => "booking_status_changed",
        Event::BookingPaid { .. } => "payment_confirmed",
        Event::SubscriptionActivated { .. } => "subscription_activated",
        Event::SubscriptionCancelScheduled { .. } => "subscription_cancel_scheduled",
        Event::SubscriptionCancelLifted { .. } => "subscription_cancel_lifted",
        Event::SubscriptionLapsed { .. } => "subscription_lapsed",
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    kind: &'static str,
    event: &'a Event,
}

/// Broadcast hub for per-business event fan-out.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for a business. Creates the channel if needed.
    pub fn subscribe(&self, business_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(business_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, business_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&business_id) {
            let kind = event_kind(event);
            let payload = serde_json::to_string(&Envelope { kind, event })
                .unwrap_or_else(|_| String::from("{}"));
            let _ = sender.send(Notice {
                business_id,
                kind,
                payload,
            });
        }
    }

    /// Remove a channel.
    #[allow(dead_code)]
    pub fn remove(&self, business_id: &Ulid) {
        self.channels.remove(business_id);
    }
}
