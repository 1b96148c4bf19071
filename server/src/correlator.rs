//! Event correlation state machine
//!
//! Every inbound event is looked up in a fixed decision table keyed by its
//! [`EventKind`]. The table says whether the event touches the record store,
//! which fields it renames or defaults, whether it stamps the reveal time or
//! measures the move duration, whether it is relayed to other peers and how
//! the sender is answered.
//!
//! | event         | store | relay | reply                        |
//! |---------------|-------|-------|------------------------------|
//! | `cardReveal`  | yes   | yes   | fixed acknowledgement        |
//! | `cardDropped` | yes   | yes   | logged / waiting             |
//! | `RobotsMove`  | yes   | no    | logged / waiting             |
//! | anything else | no    | yes   | none                         |
//!
//! Per card, a record is absent, pending, or complete. Completion is only
//! evaluated after drop and robot-move events; a complete record is
//! projected into a [`PersistedRow`], handed to the sink and evicted in one
//! synchronous step, so it can be written at most once.

use crate::record_store::{CardRecord, Completion, RecordStore};
use crate::sink::{DurationAdjustment, PersistedRow, RecordSink};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use shared::{EventKind, EventMessage, StatusReply};
use std::time::Duration;

/// How the sender of an event is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// No reply at all
    Silent,
    /// Fixed acknowledgement, completeness is not evaluated
    Acknowledge,
    /// Evaluate completeness and report logged / waiting
    Completion,
}

/// One row of the decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPolicy {
    /// Whether the event is merged into a card record at all
    pub touches_store: bool,
    /// `(from, to)` pairs copied into the record; `to` becomes `null` if
    /// `from` is missing
    pub renames: &'static [(&'static str, &'static str)],
    /// Keys inserted as `null` when the payload omits them
    pub defaults: &'static [&'static str],
    pub stamp_reveal: bool,
    pub measure_duration: bool,
    pub relay: bool,
    pub reply: ReplyPolicy,
}

const REVEAL: EventPolicy = EventPolicy {
    touches_store: true,
    renames: &[],
    defaults: &["side", "answer"],
    stamp_reveal: true,
    measure_duration: false,
    relay: true,
    reply: ReplyPolicy::Acknowledge,
};

const DROP: EventPolicy = EventPolicy {
    touches_store: true,
    renames: &[("side_choice", "side_choice_raw")],
    defaults: &[],
    stamp_reveal: false,
    measure_duration: true,
    relay: true,
    reply: ReplyPolicy::Completion,
};

const ROBOT_MOVE: EventPolicy = EventPolicy {
    touches_store: true,
    renames: &[],
    defaults: &[],
    stamp_reveal: false,
    measure_duration: false,
    relay: false,
    reply: ReplyPolicy::Completion,
};

const PASSTHROUGH: EventPolicy = EventPolicy {
    touches_store: false,
    renames: &[],
    defaults: &[],
    stamp_reveal: false,
    measure_duration: false,
    relay: true,
    reply: ReplyPolicy::Silent,
};

pub fn policy(kind: EventKind) -> &'static EventPolicy {
    match kind {
        EventKind::CardReveal => &REVEAL,
        EventKind::CardDropped => &DROP,
        EventKind::RobotsMove => &ROBOT_MOVE,
        EventKind::Other => &PASSTHROUGH,
    }
}

/// What the network layer has to do after an event was processed
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Forward the original text to every other peer
    pub relay: bool,
    /// Status reply for the sender
    pub reply: Option<StatusReply>,
    /// Row handed to the sink, if the event completed a record
    pub persisted: Option<PersistedRow>,
}

impl Dispatch {
    fn relay_only() -> Self {
        Self {
            relay: true,
            reply: None,
            persisted: None,
        }
    }

    fn rejected(reply: StatusReply) -> Self {
        Self {
            relay: false,
            reply: Some(reply),
            persisted: None,
        }
    }
}

/// Seconds from `earlier` to `later`, negative if `later` comes first.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

pub struct Correlator<S: RecordSink> {
    records: RecordStore,
    sink: S,
    adjustment: DurationAdjustment,
}

impl<S: RecordSink> Correlator<S> {
    pub fn new(sink: S, adjustment: DurationAdjustment) -> Self {
        Self {
            records: RecordStore::new(),
            sink,
            adjustment,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Processes one decoded event that arrived at `arrival`
    pub fn handle(&mut self, message: EventMessage, arrival: DateTime<Utc>) -> Dispatch {
        let kind = message.kind();
        let policy = policy(kind);

        if !policy.touches_store {
            debug!(
                "Relaying unhandled event type: {}",
                message.event_name().unwrap_or("N/A")
            );
            return Dispatch::relay_only();
        }

        let Some(card_id) = message.card_id() else {
            warn!("{} event received without cardId", kind);
            return Dispatch::rejected(StatusReply::missing_card_id(kind));
        };

        if kind != EventKind::CardReveal && !self.records.contains(&card_id) {
            warn!(
                "{} received for unknown cardId {}. Storing partial data.",
                kind, card_id
            );
        }

        let participant = message.participant().unwrap_or("N/A").to_owned();
        let mut fields = apply_policy_fields(policy, message.into_fields());
        if is_blank(fields.get("participant")) {
            fields.remove("participant");
        }

        let record = self.records.merge(&card_id, fields);
        record.event_arrival_timestamp = Some(arrival);

        if policy.stamp_reveal {
            record.reveal_timestamp = Some(arrival);
            info!(
                "Stored reveal timestamp for cardId {} (participant {}): {}",
                card_id,
                participant,
                arrival.to_rfc3339()
            );
        }

        if policy.measure_duration {
            measure_duration(&card_id, record, arrival);
        }

        match policy.reply {
            ReplyPolicy::Silent => Dispatch {
                relay: policy.relay,
                reply: None,
                persisted: None,
            },
            ReplyPolicy::Acknowledge => Dispatch {
                relay: policy.relay,
                reply: Some(StatusReply::reveal_forwarded()),
                persisted: None,
            },
            ReplyPolicy::Completion => {
                let (reply, persisted) = self.evaluate(kind, &card_id);
                Dispatch {
                    relay: policy.relay,
                    reply,
                    persisted,
                }
            }
        }
    }

    fn evaluate(
        &mut self,
        kind: EventKind,
        card_id: &str,
    ) -> (Option<StatusReply>, Option<PersistedRow>) {
        match self.records.take_if_complete(card_id) {
            Completion::Absent => (None, None),
            Completion::Pending { missing } => {
                debug!("cardId {} still waiting for {:?}", card_id, missing);
                (Some(StatusReply::waiting(kind)), None)
            }
            Completion::Complete(record) => {
                info!("Record complete for cardId {}. Writing to sink.", card_id);
                let row = PersistedRow::from_record(&record, &self.adjustment);
                if let Err(e) = self.sink.append(&row) {
                    error!("Failed to persist record for cardId {}: {}", card_id, e);
                }
                (Some(StatusReply::logged()), Some(row))
            }
        }
    }

    /// Drops incomplete records that have not changed within `max_age`
    pub fn evict_stale(&mut self, max_age: Duration) -> Vec<String> {
        self.records.evict_stale(max_age)
    }
}

fn apply_policy_fields(policy: &EventPolicy, mut fields: Map<String, Value>) -> Map<String, Value> {
    for (from, to) in policy.renames {
        let value = fields.get(*from).cloned().unwrap_or(Value::Null);
        fields.insert((*to).to_string(), value);
    }
    for key in policy.defaults {
        fields.entry(*key).or_insert(Value::Null);
    }
    fields
}

/// An empty or `null` value must not overwrite one already on the record
fn is_blank(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Null)) || value.and_then(Value::as_str) == Some("")
}

fn measure_duration(card_id: &str, record: &mut CardRecord, drop_time: DateTime<Utc>) {
    match record.reveal_timestamp {
        Some(reveal_time) => {
            let seconds = seconds_between(reveal_time, drop_time);
            debug!("Calculated duration for cardId {}: {:.3}s", card_id, seconds);
            record.move_duration = Some(seconds);
        }
        None => {
            warn!(
                "cardDropped received for cardId {}, but no reveal timestamp found",
                card_id
            );
            record.move_duration = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, DEFAULT_ALTERNATE_CONDITION};
    use assert_approx_eq::assert_approx_eq;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn at_millis(ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(ms)
    }

    fn event(value: Value) -> EventMessage {
        EventMessage::from_fields(value.as_object().cloned().unwrap())
    }

    fn reveal(card_id: &str) -> EventMessage {
        event(json!({
            "event": "cardReveal",
            "cardId": card_id,
            "participant": "P01",
            "side": "left",
            "answer": "42",
        }))
    }

    fn drop_event(card_id: &str) -> EventMessage {
        event(json!({"event": "cardDropped", "cardId": card_id, "side_choice": "left"}))
    }

    fn robot_move(card_id: &str, robot: &str) -> EventMessage {
        event(json!({
            "event": "RobotsMove",
            "cardId": card_id,
            "question": "Q1",
            "difficulty": "easy",
            "Robot": robot,
            "gazeDecision": "left",
        }))
    }

    fn correlator() -> (Correlator<MemorySink>, MemorySink) {
        let sink = MemorySink::new();
        (
            Correlator::new(sink.clone(), DurationAdjustment::default()),
            sink,
        )
    }

    #[test]
    fn test_decision_table() {
        assert!(policy(EventKind::CardReveal).relay);
        assert_eq!(policy(EventKind::CardReveal).reply, ReplyPolicy::Acknowledge);
        assert!(policy(EventKind::CardDropped).relay);
        assert!(policy(EventKind::CardDropped).measure_duration);
        assert!(!policy(EventKind::RobotsMove).relay);
        assert_eq!(policy(EventKind::RobotsMove).reply, ReplyPolicy::Completion);
        assert!(!policy(EventKind::Other).touches_store);
        assert_eq!(policy(EventKind::Other).reply, ReplyPolicy::Silent);
    }

    #[test]
    fn test_worked_example() {
        let (mut correlator, sink) = correlator();

        let dispatch = correlator.handle(reveal("c1"), at_millis(0));
        assert!(dispatch.relay);
        assert_eq!(dispatch.reply, Some(StatusReply::reveal_forwarded()));

        let dispatch = correlator.handle(drop_event("c1"), at_millis(1250));
        assert!(dispatch.relay);
        assert_eq!(
            dispatch.reply,
            Some(StatusReply::waiting(EventKind::CardDropped))
        );

        let dispatch = correlator.handle(robot_move("c1", "control"), at_millis(3000));
        assert!(!dispatch.relay);
        assert_eq!(dispatch.reply, Some(StatusReply::logged()));

        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.correct_side, "left");
        assert_eq!(row.correct_answer, "42");
        assert_eq!(row.participants_side_choice, "left");
        assert_eq!(row.move_duration, "1.250");
        assert_eq!(row.participant, "P01");
        assert_eq!(row.timestamp, "2024-05-01T09:00:03+00:00");
        assert_eq!(dispatch.persisted.as_ref(), Some(row));
        assert!(correlator.records().is_empty());
    }

    #[test]
    fn test_move_duration_precision() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(reveal("c1"), at_millis(0));
        correlator.handle(drop_event("c1"), at_millis(2_718));

        let record = correlator.records().get("c1").unwrap();
        assert_approx_eq!(record.move_duration.unwrap(), 2.718, 1e-9);
    }

    #[test]
    fn test_drop_without_reveal_has_blank_duration() {
        let (mut correlator, sink) = correlator();

        correlator.handle(drop_event("c2"), at_millis(500));
        assert_eq!(correlator.records().get("c2").unwrap().move_duration, None);

        correlator.handle(robot_move("c2", "control"), at_millis(600));
        // Still waiting for side and answer from the reveal.
        assert!(sink.rows().is_empty());

        correlator.handle(reveal("c2"), at_millis(700));
        assert!(sink.rows().is_empty());

        correlator.handle(robot_move("c2", "control"), at_millis(800));
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].move_duration, "");
    }

    #[test]
    fn test_reveal_never_reports_completion() {
        let (mut correlator, sink) = correlator();

        correlator.handle(drop_event("c3"), at_millis(0));
        correlator.handle(robot_move("c3", "control"), at_millis(10));
        let dispatch = correlator.handle(reveal("c3"), at_millis(20));

        assert_eq!(dispatch.reply, Some(StatusReply::reveal_forwarded()));
        assert_eq!(dispatch.persisted, None);
        assert!(sink.rows().is_empty());
        assert!(correlator.records().get("c3").unwrap().is_complete());
    }

    #[test]
    fn test_completion_is_order_independent() {
        let fragments = ["reveal", "drop", "robot"];
        let orders: [[usize; 3]; 4] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [2, 0, 1]];

        for order in orders {
            let (mut correlator, sink) = correlator();
            for (step, &index) in order.iter().enumerate() {
                let message = match fragments[index] {
                    "reveal" => reveal("c4"),
                    "drop" => drop_event("c4"),
                    _ => robot_move("c4", "control"),
                };
                correlator.handle(message, at_millis(step as i64 * 100));
            }

            let rows = sink.rows();
            assert_eq!(rows.len(), 1, "order {:?}", order);
            let row = &rows[0];
            assert_eq!(row.card_id, "c4");
            assert_eq!(row.correct_side, "left");
            assert_eq!(row.correct_answer, "42");
            assert_eq!(row.participants_side_choice, "left");
            assert_eq!(row.question, "Q1");
            assert_eq!(row.gaze_decision, "left");
            assert!(correlator.records().is_empty());
        }
    }

    #[test]
    fn test_record_persisted_once_then_fresh() {
        let (mut correlator, sink) = correlator();

        correlator.handle(reveal("c5"), at_millis(0));
        correlator.handle(drop_event("c5"), at_millis(1000));
        correlator.handle(robot_move("c5", "control"), at_millis(2000));
        assert_eq!(sink.rows().len(), 1);

        let dispatch = correlator.handle(robot_move("c5", "control"), at_millis(3000));
        assert_eq!(
            dispatch.reply,
            Some(StatusReply::waiting(EventKind::RobotsMove))
        );
        assert_eq!(sink.rows().len(), 1);

        let record = correlator.records().get("c5").unwrap();
        assert!(record.field("side").is_none());
        assert!(record.reveal_timestamp.is_none());
    }

    #[test]
    fn test_missing_card_id_is_rejected() {
        let (mut correlator, _sink) = correlator();

        for (message, kind) in [
            (event(json!({"event": "cardReveal", "side": "left"})), EventKind::CardReveal),
            (event(json!({"event": "cardDropped", "cardId": ""})), EventKind::CardDropped),
            (event(json!({"event": "RobotsMove", "cardId": null})), EventKind::RobotsMove),
        ] {
            let dispatch = correlator.handle(message, at_millis(0));
            assert!(!dispatch.relay);
            assert_eq!(dispatch.reply, Some(StatusReply::missing_card_id(kind)));
        }
        assert!(correlator.records().is_empty());
    }

    #[test]
    fn test_unknown_event_bypasses_store() {
        let (mut correlator, _sink) = correlator();

        let dispatch = correlator.handle(
            event(json!({"event": "startRound", "cardId": "c6", "round": 2})),
            at_millis(0),
        );
        assert_eq!(dispatch, Dispatch::relay_only());

        let dispatch = correlator.handle(event(json!({"hello": "world"})), at_millis(0));
        assert_eq!(dispatch, Dispatch::relay_only());
        assert!(correlator.records().is_empty());
    }

    #[test]
    fn test_reveal_defaults_side_and_answer() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(event(json!({"event": "cardReveal", "cardId": "c7"})), at_millis(0));

        let record = correlator.records().get("c7").unwrap();
        assert_eq!(record.field("side"), Some(&Value::Null));
        assert_eq!(record.field("answer"), Some(&Value::Null));
        assert_eq!(record.reveal_timestamp, Some(at_millis(0)));
    }

    #[test]
    fn test_drop_renames_side_choice() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(drop_event("c8"), at_millis(0));
        correlator.handle(
            event(json!({"event": "cardDropped", "cardId": "c9"})),
            at_millis(0),
        );

        let record = correlator.records().get("c8").unwrap();
        assert_eq!(record.field("side_choice_raw"), Some(&json!("left")));
        let record = correlator.records().get("c9").unwrap();
        assert_eq!(record.field("side_choice_raw"), Some(&Value::Null));
    }

    #[test]
    fn test_numeric_and_string_card_ids_correlate() {
        let (mut correlator, sink) = correlator();

        correlator.handle(
            event(json!({"event": "cardReveal", "cardId": 17, "side": "left", "answer": "42"})),
            at_millis(0),
        );
        correlator.handle(drop_event("17"), at_millis(300));
        let dispatch = correlator.handle(
            event(json!({
                "event": "RobotsMove",
                "cardId": 17,
                "question": "Q1",
                "difficulty": "easy",
                "Robot": "control",
                "gazeDecision": "left",
            })),
            at_millis(600),
        );

        assert_eq!(dispatch.reply, Some(StatusReply::logged()));
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].card_id, "17");
        assert_eq!(rows[0].move_duration, "0.300");
    }

    #[test]
    fn test_empty_participant_does_not_overwrite() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(reveal("c14"), at_millis(0));
        correlator.handle(
            event(json!({"event": "cardDropped", "cardId": "c14", "participant": ""})),
            at_millis(100),
        );

        let record = correlator.records().get("c14").unwrap();
        assert_eq!(record.field("participant"), Some(&json!("P01")));
    }

    #[test]
    fn test_null_participant_does_not_overwrite() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(reveal("c15"), at_millis(0));
        correlator.handle(
            event(json!({"event": "RobotsMove", "cardId": "c15", "participant": null})),
            at_millis(100),
        );

        let record = correlator.records().get("c15").unwrap();
        assert_eq!(record.field("participant"), Some(&json!("P01")));
    }

    #[test]
    fn test_numeric_participant_persisted_verbatim() {
        let (mut correlator, sink) = correlator();

        correlator.handle(
            event(json!({
                "event": "cardReveal",
                "cardId": "c16",
                "participant": 7,
                "side": "right",
                "answer": "9",
            })),
            at_millis(0),
        );
        correlator.handle(drop_event("c16"), at_millis(500));
        correlator.handle(robot_move("c16", "control"), at_millis(900));

        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].participant, "7");
    }

    #[test]
    fn test_arrival_timestamp_tracks_latest_fragment() {
        let (mut correlator, _sink) = correlator();

        correlator.handle(reveal("c10"), at_millis(0));
        correlator.handle(drop_event("c10"), at_millis(400));

        let record = correlator.records().get("c10").unwrap();
        assert_eq!(record.event_arrival_timestamp, Some(at_millis(400)));
        assert_eq!(record.reveal_timestamp, Some(at_millis(0)));
    }

    #[test]
    fn test_alternate_condition_adjustment() {
        let (mut correlator, sink) = correlator();

        correlator.handle(reveal("c11"), at_millis(0));
        correlator.handle(drop_event("c11"), at_millis(3_500));
        correlator.handle(robot_move("c11", DEFAULT_ALTERNATE_CONDITION), at_millis(4_000));

        assert_eq!(sink.rows()[0].move_duration, "1.500");
    }

    #[test]
    fn test_negative_duration_is_persisted() {
        let (mut correlator, sink) = correlator();

        correlator.handle(reveal("c12"), at_millis(1_000));
        correlator.handle(drop_event("c12"), at_millis(250));
        correlator.handle(robot_move("c12", "control"), at_millis(2_000));

        assert_eq!(sink.rows()[0].move_duration, "-0.750");
    }

    #[test]
    fn test_sink_failure_still_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut correlator = Correlator::new(
            crate::sink::CsvSink::new(dir.path()),
            DurationAdjustment::default(),
        );

        correlator.handle(reveal("c13"), at_millis(0));
        correlator.handle(drop_event("c13"), at_millis(100));
        let dispatch = correlator.handle(robot_move("c13", "control"), at_millis(200));

        assert_eq!(dispatch.reply, Some(StatusReply::logged()));
        assert!(correlator.records().is_empty());
    }

    #[test]
    fn test_seconds_between() {
        assert_approx_eq!(seconds_between(at_millis(0), at_millis(1_250)), 1.25, 1e-9);
        assert_approx_eq!(seconds_between(at_millis(1_250), at_millis(0)), -1.25, 1e-9);
    }
}
