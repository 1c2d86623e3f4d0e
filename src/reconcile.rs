//! Local mirrors of the backend collections.
//!
//! Four sources write into the delivery list: the initial fetch, optimistic
//! driver actions, the realtime feed and the 10s poll. `DeliveryBook::apply`
//! folds every one of them through a single reducer so ordering rules live in
//! one place and can be tested without network or timers. The reducer never
//! performs I/O; it returns an [`Effect`] telling the caller which remote call
//! (if any) the event requires.
//!
//! Invariants after every `apply`:
//! - at most one entry per server id;
//! - a placeholder and the record created from it are never both present.
//!
//! A record counts as created from a placeholder when it has the same order
//! reference and starts no earlier; older deliveries for a reused order
//! reference are unrelated.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::models::{
    Delivery, DeliveryEntry, DeliveryKey, DeliveryStatus, LocalRef, NewDelivery, Payment, Sale,
};

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// Full snapshot from the initial fetch or a poll.
    Loaded(Vec<Delivery>),
    StartRequested {
        local_ref: LocalRef,
        draft: NewDelivery,
    },
    StartConfirmed {
        local_ref: LocalRef,
        record: Delivery,
    },
    StartFailed {
        local_ref: LocalRef,
    },
    RemoteInserted(Delivery),
    RemoteUpdated(Delivery),
    RemoteDeleted(i64),
    ConfirmRequested {
        key: DeliveryKey,
        at: DateTime<Utc>,
    },
    /// `record` is the updated row on success, `None` when the update failed.
    ConfirmSettled {
        id: i64,
        record: Option<Delivery>,
    },
    CancelRequested(DeliveryKey),
    DeleteSettled {
        id: i64,
        ok: bool,
    },
}

/// Follow-up the caller must perform after applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    ConfirmRemote { id: i64, at: DateTime<Utc> },
    DeleteRemote(i64),
    Refetch,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum InFlight {
    Confirm { at: DateTime<Utc> },
    Delete,
}

#[derive(Debug, Clone)]
struct PendingStart {
    order_id: String,
    start_time: DateTime<Utc>,
    cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryBook {
    entries: Vec<DeliveryEntry>,
    pending: HashMap<LocalRef, PendingStart>,
    in_flight: HashMap<i64, InFlight>,
}

impl DeliveryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[DeliveryEntry] {
        &self.entries
    }

    pub fn get(&self, key: &DeliveryKey) -> Option<&DeliveryEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of remote calls this book is still waiting on.
    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn apply(&mut self, event: DeliveryEvent) -> Effect {
        match event {
            DeliveryEvent::Loaded(snapshot) => {
                self.load_snapshot(snapshot);
                Effect::None
            }
            DeliveryEvent::StartRequested { local_ref, draft } => {
                self.pending.insert(
                    local_ref,
                    PendingStart {
                        order_id: draft.order_id.clone(),
                        start_time: draft.start_time,
                        cancelled: false,
                    },
                );
                self.entries
                    .insert(0, DeliveryEntry::placeholder(local_ref, &draft));
                Effect::None
            }
            DeliveryEvent::StartConfirmed { local_ref, record } => {
                self.start_confirmed(local_ref, record)
            }
            DeliveryEvent::StartFailed { local_ref } => {
                self.pending.remove(&local_ref);
                self.remove_key(&DeliveryKey::Pending { local_ref });
                Effect::None
            }
            DeliveryEvent::RemoteInserted(record) => {
                self.remote_inserted(record);
                Effect::None
            }
            DeliveryEvent::RemoteUpdated(record) => {
                if self.in_flight.get(&record.id) == Some(&InFlight::Delete) {
                    return Effect::None;
                }
                let entry = self.overlay(record.into());
                if let Some(pos) = self.position_of_id(entry_id(&entry)) {
                    self.entries[pos] = entry;
                }
                Effect::None
            }
            DeliveryEvent::RemoteDeleted(id) => {
                self.remove_key(&DeliveryKey::Confirmed { id });
                Effect::None
            }
            DeliveryEvent::ConfirmRequested { key, at } => self.confirm_requested(key, at),
            DeliveryEvent::ConfirmSettled { id, record } => {
                // A cancel issued meanwhile owns the marker until its delete settles.
                if matches!(self.in_flight.get(&id), Some(InFlight::Confirm { .. })) {
                    self.in_flight.remove(&id);
                }
                let Some(pos) = self.position_of_id(id) else {
                    return Effect::None;
                };
                match record {
                    Some(record) => self.entries[pos] = record.into(),
                    None => {
                        let entry = &mut self.entries[pos];
                        entry.status = DeliveryStatus::InRoute;
                        entry.delivered_at = None;
                    }
                }
                Effect::None
            }
            DeliveryEvent::CancelRequested(key) => self.cancel_requested(key),
            DeliveryEvent::DeleteSettled { id, ok } => {
                self.in_flight.remove(&id);
                if ok {
                    Effect::None
                } else {
                    Effect::Refetch
                }
            }
        }
    }

    fn load_snapshot(&mut self, snapshot: Vec<Delivery>) {
        let mut seen: HashSet<i64> = HashSet::new();
        let mut confirmed: Vec<DeliveryEntry> = Vec::with_capacity(snapshot.len());
        for record in snapshot {
            if !seen.insert(record.id) {
                continue;
            }
            if self.in_flight.get(&record.id) == Some(&InFlight::Delete) {
                continue;
            }
            if self.cancelled_counterpart(&record) {
                continue;
            }
            confirmed.push(self.overlay(record.into()));
        }

        let mut next: Vec<DeliveryEntry> = self
            .entries
            .iter()
            .filter(|e| match e.key {
                DeliveryKey::Pending { local_ref } => {
                    self.pending.contains_key(&local_ref)
                        && !confirmed
                            .iter()
                            .any(|c| created_from(&e.order_id, e.start_time, &c.order_id, c.start_time))
                }
                DeliveryKey::Confirmed { .. } => false,
            })
            .cloned()
            .collect();
        next.extend(confirmed);
        self.entries = next;
    }

    fn start_confirmed(&mut self, local_ref: LocalRef, record: Delivery) -> Effect {
        let pending = self.pending.remove(&local_ref);
        let placeholder = DeliveryKey::Pending { local_ref };

        if pending.as_ref().map(|p| p.cancelled).unwrap_or(false) {
            self.remove_key(&placeholder);
            self.remove_key(&DeliveryKey::Confirmed { id: record.id });
            self.in_flight.insert(record.id, InFlight::Delete);
            return Effect::DeleteRemote(record.id);
        }

        let id = record.id;
        let entry = self.overlay(record.into());
        match (self.position_of_key(&placeholder), self.position_of_id(id)) {
            (Some(slot), None) => self.entries[slot] = entry,
            (Some(slot), Some(existing)) => {
                self.entries[existing] = entry;
                self.entries.remove(slot);
            }
            (None, Some(existing)) => self.entries[existing] = entry,
            (None, None) => {
                if self.in_flight.get(&id) != Some(&InFlight::Delete) {
                    self.drop_placeholders_for(&entry.order_id, entry.start_time);
                    self.entries.insert(0, entry);
                }
            }
        }
        Effect::None
    }

    fn remote_inserted(&mut self, record: Delivery) {
        if self.in_flight.get(&record.id) == Some(&InFlight::Delete) {
            return;
        }
        if self.cancelled_counterpart(&record) {
            return;
        }
        let entry = self.overlay(record.into());
        self.drop_placeholders_for(&entry.order_id, entry.start_time);
        match self.position_of_id(entry_id(&entry)) {
            Some(pos) => self.entries[pos] = entry,
            None => self.entries.insert(0, entry),
        }
    }

    fn confirm_requested(&mut self, key: DeliveryKey, at: DateTime<Utc>) -> Effect {
        let id = match key {
            DeliveryKey::Confirmed { id } => id,
            DeliveryKey::Pending { .. } => {
                return Effect::Rejected("Delivery is still being saved".into());
            }
        };
        let Some(pos) = self.position_of_id(id) else {
            return Effect::Rejected(format!("Delivery {id} not found"));
        };
        let entry = &mut self.entries[pos];
        if entry.status == DeliveryStatus::Delivered {
            return Effect::Rejected(format!("Delivery {id} is already delivered"));
        }
        entry.status = DeliveryStatus::Delivered;
        entry.delivered_at = Some(at);
        self.in_flight.insert(id, InFlight::Confirm { at });
        Effect::ConfirmRemote { id, at }
    }

    fn cancel_requested(&mut self, key: DeliveryKey) -> Effect {
        match key {
            DeliveryKey::Pending { local_ref } => {
                self.remove_key(&key);
                if let Some(pending) = self.pending.get_mut(&local_ref) {
                    pending.cancelled = true;
                }
                Effect::None
            }
            DeliveryKey::Confirmed { id } => {
                if self.position_of_id(id).is_none() {
                    return Effect::Rejected(format!("Delivery {id} not found"));
                }
                self.remove_key(&key);
                self.in_flight.insert(id, InFlight::Delete);
                Effect::DeleteRemote(id)
            }
        }
    }

    /// Re-apply an in-flight confirm to a record coming from the backend.
    fn overlay(&self, mut entry: DeliveryEntry) -> DeliveryEntry {
        if let Some(id) = entry.server_id() {
            if let Some(InFlight::Confirm { at }) = self.in_flight.get(&id) {
                if entry.status == DeliveryStatus::InRoute {
                    entry.status = DeliveryStatus::Delivered;
                    entry.delivered_at = Some(*at);
                }
            }
        }
        entry
    }

    /// Whether `record` was created by a start the driver already cancelled.
    fn cancelled_counterpart(&self, record: &Delivery) -> bool {
        self.pending.values().any(|p| {
            p.cancelled && created_from(&p.order_id, p.start_time, &record.order_id, record.start_time)
        })
    }

    fn drop_placeholders_for(&mut self, order_id: &str, start_time: DateTime<Utc>) {
        self.entries.retain(|e| {
            !(e.key.is_pending() && created_from(&e.order_id, e.start_time, order_id, start_time))
        });
    }

    fn remove_key(&mut self, key: &DeliveryKey) {
        self.entries.retain(|e| &e.key != key);
    }

    fn position_of_key(&self, key: &DeliveryKey) -> Option<usize> {
        self.entries.iter().position(|e| &e.key == key)
    }

    fn position_of_id(&self, id: i64) -> Option<usize> {
        self.position_of_key(&DeliveryKey::Confirmed { id })
    }
}

fn created_from(
    placeholder_order: &str,
    placeholder_start: DateTime<Utc>,
    record_order: &str,
    record_start: DateTime<Utc>,
) -> bool {
    placeholder_order == record_order && record_start >= placeholder_start
}

fn entry_id(entry: &DeliveryEntry) -> i64 {
    entry.server_id().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Sales / payments
// ---------------------------------------------------------------------------

/// A backend row with a numeric id and a business date.
pub trait Record: Clone {
    fn id(&self) -> i64;
    fn sort_key(&self) -> (NaiveDate, DateTime<Utc>);
}

impl Record for Sale {
    fn id(&self) -> i64 {
        self.id
    }

    fn sort_key(&self) -> (NaiveDate, DateTime<Utc>) {
        (self.date, self.created_at)
    }
}

impl Record for Payment {
    fn id(&self) -> i64 {
        self.id
    }

    fn sort_key(&self) -> (NaiveDate, DateTime<Utc>) {
        (self.date, self.created_at)
    }
}

/// Mirror of a collection without optimistic writes: newest date first,
/// one row per id.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct RecordList<T> {
    rows: Vec<T>,
}

impl<T> Default for RecordList<T> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<T: Record> RecordList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&T> {
        self.rows.iter().find(|r| r.id() == id)
    }

    pub fn replace_all(&mut self, rows: Vec<T>) {
        let mut seen = HashSet::new();
        self.rows = rows.into_iter().filter(|r| seen.insert(r.id())).collect();
        self.sort();
    }

    pub fn upsert(&mut self, row: T) {
        match self.rows.iter().position(|r| r.id() == row.id()) {
            Some(pos) => self.rows[pos] = row,
            None => self.rows.push(row),
        }
        self.sort();
    }

    /// Apply a realtime update: replaces a known row, ignores unknown ids.
    pub fn update_existing(&mut self, row: T) {
        if let Some(pos) = self.rows.iter().position(|r| r.id() == row.id()) {
            self.rows[pos] = row;
            self.sort();
        }
    }

    pub fn remove(&mut self, id: i64) -> Option<T> {
        let pos = self.rows.iter().position(|r| r.id() == id)?;
        Some(self.rows.remove(pos))
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    }
}
