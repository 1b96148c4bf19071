//! In-flight card records keyed by `cardId`
//!
//! A card record collects the fields of several event fragments (reveal,
//! drop, robot move) until every required key has been seen. The store
//! holds at most one record per `cardId`; a completed record is removed in
//! the same step that judges it complete.
//!
//! Records that never complete stay in the store until the process exits,
//! unless the server is started with stale-record eviction enabled.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{Map, Value};
use shared::REQUIRED_FIELDS;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Partial composite record for one card
#[derive(Debug, Clone)]
pub struct CardRecord {
    /// Payload fields merged from every fragment, later values win
    pub fields: Map<String, Value>,
    /// Server arrival time of the reveal fragment
    pub reveal_timestamp: Option<DateTime<Utc>>,
    /// Server arrival time of the most recently merged fragment
    pub event_arrival_timestamp: Option<DateTime<Utc>>,
    /// Seconds between reveal and drop; None when the drop had no reveal
    pub move_duration: Option<f64>,
    last_touched: Instant,
}

impl Default for CardRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl CardRecord {
    /// Creates an empty record with no timestamps or duration
    pub fn new() -> Self {
        Self {
            fields: Map::new(),
            reveal_timestamp: None,
            event_arrival_timestamp: None,
            move_duration: None,
            last_touched: Instant::now(),
        }
    }

    /// Shallow merge; same-named fields are overwritten.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
        self.last_touched = Instant::now();
    }

    /// Looks up a merged payload field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Required keys not yet seen. A key holding `null` counts as seen.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|key| !self.fields.contains_key(*key))
            .collect()
    }

    /// Returns true once every required key has been merged
    ///
    /// Only key presence matters; a `null` value still counts.
    pub fn is_complete(&self) -> bool {
        REQUIRED_FIELDS
            .iter()
            .all(|key| self.fields.contains_key(*key))
    }

    /// Returns true if no fragment has been merged for longer than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.last_touched.elapsed() > max_age
    }
}

/// Result of checking a card for completeness
#[derive(Debug, Clone)]
pub enum Completion {
    /// No record exists for the card
    Absent,
    /// Record exists but is still waiting for the listed fields
    Pending { missing: Vec<&'static str> },
    /// Record was complete and has been removed from the store
    Complete(CardRecord),
}

#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<String, CardRecord>,
}

impl RecordStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the in-flight record for `card_id`, if any
    pub fn get(&self, card_id: &str) -> Option<&CardRecord> {
        self.records.get(card_id)
    }

    /// Returns true if a record for `card_id` is still waiting for fragments
    pub fn contains(&self, card_id: &str) -> bool {
        self.records.contains_key(card_id)
    }

    /// Returns the record for `card_id`, creating an empty one if needed
    pub fn get_or_create(&mut self, card_id: &str) -> &mut CardRecord {
        self.records.entry(card_id.to_string()).or_insert_with(|| {
            debug!("Created record for cardId {}", card_id);
            CardRecord::new()
        })
    }

    /// Merges one fragment's fields into the record for `card_id`
    ///
    /// Creates the record if this is the first fragment for the card.
    /// Same-named fields from earlier fragments are overwritten. Returns the
    /// record so the caller can stamp timestamps on it.
    pub fn merge(&mut self, card_id: &str, fields: Map<String, Value>) -> &mut CardRecord {
        let record = self.get_or_create(card_id);
        record.merge(fields);
        record
    }

    /// Removes and returns the record for `card_id`
    ///
    /// Deleting an unknown card is a no-op.
    pub fn delete(&mut self, card_id: &str) -> Option<CardRecord> {
        self.records.remove(card_id)
    }

    /// Checks completeness and evicts the record in the same step
    pub fn take_if_complete(&mut self, card_id: &str) -> Completion {
        match self.records.get(card_id) {
            None => Completion::Absent,
            Some(record) if !record.is_complete() => Completion::Pending {
                missing: record.missing_fields(),
            },
            Some(_) => match self.records.remove(card_id) {
                Some(record) => Completion::Complete(record),
                None => Completion::Absent,
            },
        }
    }

    /// Removes incomplete records not touched within `max_age`
    ///
    /// Returns the evicted card IDs.
    pub fn evict_stale(&mut self, max_age: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_stale(max_age))
            .map(|(card_id, _)| card_id.clone())
            .collect();

        for card_id in &stale {
            if let Some(record) = self.records.remove(card_id) {
                warn!(
                    "Evicting incomplete record for cardId {} (missing {:?})",
                    card_id,
                    record.missing_fields()
                );
            }
        }

        stale
    }

    /// Number of records still in flight
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
