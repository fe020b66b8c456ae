//! Keyed upsert state machine with last-writer-wins sequencing.
//!
//! Each target key is either absent or present with a stored sequence value.
//!
//! ```text
//! Absent  --event-->                     Present(seq)   insert
//! Present --event, seq >= stored-->      Present(seq)   overwrite all columns
//! Present --event, seq <  stored-->      Present(stored) discard (late)
//! ```
//!
//! Redelivering an applied event lands on `seq == stored` with an identical
//! row, which changes nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use claims360_table::{ChangeType, CommitMetrics, Row, RowChange};

use crate::error::{Error, Result};
use crate::model::{EnrichedEvent, SEQUENCE_COLUMN};

/// Stored state of one target key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRow {
    /// Sequence value of the event that produced the row.
    pub sequence: DateTime<Utc>,
    /// Stored row, including the hidden sequence column.
    pub row: Row,
}

/// What an incoming event does to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The key was absent; the event's row is inserted.
    Insert,
    /// The event is at least as new as the stored row and differs from it.
    Update,
    /// The event equals the stored row at the same sequence.
    Unchanged,
    /// The event is older than the stored row.
    DiscardLate,
}

/// Returns true if `incoming` may overwrite a row stored at `stored`.
#[must_use]
pub fn supersedes(incoming: DateTime<Utc>, stored: DateTime<Utc>) -> bool {
    incoming >= stored
}

/// Decides the transition for `incoming` against the stored state.
#[must_use]
pub fn transition(stored: Option<&IndexedRow>, incoming: &IndexedRow) -> Transition {
    match stored {
        None => Transition::Insert,
        Some(stored) if !supersedes(incoming.sequence, stored.sequence) => Transition::DiscardLate,
        Some(stored) if stored.sequence == incoming.sequence && stored.row == incoming.row => {
            Transition::Unchanged
        }
        Some(_) => Transition::Update,
    }
}

/// In-memory index of the merge target at one committed version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetIndex {
    version: u64,
    rows: BTreeMap<String, IndexedRow>,
}

impl TargetIndex {
    /// Builds the index from the rows of a committed target snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptTarget`] if a row lacks its key, lacks a
    /// parseable sequence, or repeats a key.
    pub fn from_rows(table: &str, version: u64, rows: Vec<Row>) -> Result<Self> {
        let corrupt = |message: String| Error::CorruptTarget {
            table: table.to_string(),
            message,
        };

        let mut indexed = BTreeMap::new();
        for row in rows {
            let key = row
                .get("event_key")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| corrupt("row without event_key".to_string()))?
                .to_string();
            let sequence = row
                .get(SEQUENCE_COLUMN)
                .and_then(serde_json::Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .ok_or_else(|| corrupt(format!("row {key} has no valid {SEQUENCE_COLUMN}")))?
                .with_timezone(&Utc);
            if indexed
                .insert(key.clone(), IndexedRow { sequence, row })
                .is_some()
            {
                return Err(corrupt(format!("event_key {key} appears twice")));
            }
        }

        Ok(Self {
            version,
            rows: indexed,
        })
    }

    /// Target version the index reflects.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the index holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stored state of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&IndexedRow> {
        self.rows.get(key)
    }

    /// All stored rows, ordered by key.
    #[must_use]
    pub fn to_rows(&self) -> Vec<Row> {
        self.rows.values().map(|r| r.row.clone()).collect()
    }

    /// Re-stamps the index after its contents were committed as `version`.
    #[must_use]
    pub fn at_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

/// Reduces a micro-batch to one event per key with the same sequence rule
/// the merge applies. Ties go to the later event in stream order.
///
/// Returns the winners by key and the number of events they replaced.
#[must_use]
pub fn reduce_batch(events: Vec<EnrichedEvent>) -> (BTreeMap<String, EnrichedEvent>, u64) {
    let total = events.len() as u64;
    let mut winners: BTreeMap<String, EnrichedEvent> = BTreeMap::new();
    for event in events {
        let keep_current = winners.get(event.key()).is_some_and(|current| {
            !supersedes(event.processing_timestamp, current.processing_timestamp)
        });
        if !keep_current {
            winners.insert(event.key().to_string(), event);
        }
    }
    let superseded = total - winners.len() as u64;
    (winners, superseded)
}

/// Per-batch merge outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    /// New keys.
    pub inserted: u64,
    /// Overwritten keys.
    pub updated: u64,
    /// Redelivered events that changed nothing.
    pub unchanged: u64,
    /// Events older than the stored row.
    pub discarded_late: u64,
    /// Events replaced by a newer event for the same key in the same batch.
    pub superseded: u64,
    /// Invalid events written to quarantine.
    pub quarantined: u64,
    /// Source rows dropped by the denial filter.
    pub filtered: u64,
}

/// Result of applying one reduced batch to an index.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// Index contents after the batch (still at the read version).
    pub index: TargetIndex,
    /// Row-level changes, ordered by key.
    pub changes: Vec<RowChange>,
    /// Outcome counts.
    pub counts: MergeCounts,
}

impl MergePlan {
    /// Commit metrics for this plan.
    #[must_use]
    pub fn commit_metrics(&self) -> CommitMetrics {
        CommitMetrics {
            num_output_rows: self.index.len() as u64,
            num_inserted_rows: self.counts.inserted,
            num_updated_rows: self.counts.updated,
            num_deleted_rows: 0,
        }
    }
}

/// Applies reduced events to a copy of `index`.
///
/// # Errors
///
/// Returns an error if an event does not serialize to a row.
pub fn plan_merge(
    index: &TargetIndex,
    events: BTreeMap<String, EnrichedEvent>,
) -> Result<MergePlan> {
    let mut next = index.clone();
    let mut changes = Vec::new();
    let mut counts = MergeCounts::default();

    for (key, event) in events {
        let incoming = IndexedRow {
            sequence: event.processing_timestamp,
            row: event.to_target_row()?,
        };
        match transition(next.rows.get(&key), &incoming) {
            Transition::Insert => {
                counts.inserted += 1;
                changes.push(RowChange::new(ChangeType::Insert, public_row(&incoming.row)));
                next.rows.insert(key, incoming);
            }
            Transition::Update => {
                counts.updated += 1;
                if let Some(previous) = next.rows.insert(key, incoming.clone()) {
                    changes.push(RowChange::new(
                        ChangeType::UpdatePreimage,
                        public_row(&previous.row),
                    ));
                }
                changes.push(RowChange::new(
                    ChangeType::UpdatePostimage,
                    public_row(&incoming.row),
                ));
            }
            Transition::Unchanged => counts.unchanged += 1,
            Transition::DiscardLate => counts.discarded_late += 1,
        }
    }

    Ok(MergePlan {
        index: next,
        changes,
        counts,
    })
}

/// Drops the hidden sequence column from a row.
fn public_row(row: &Row) -> Row {
    let mut row = row.clone();
    row.remove(SEQUENCE_COLUMN);
    row
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::model::{DenialEvent, UNKNOWN_PAYER};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn event(key: &str, minute: u32, reason_category: &str) -> EnrichedEvent {
        EnrichedEvent {
            event: DenialEvent {
                event_key: key.into(),
                claim_id: "C1".into(),
                payer_id: None,
                payer_name: UNKNOWN_PAYER.into(),
                event_ts: at(minute),
                payment_date: None,
                remit_id: Some("R1".into()),
                check_or_eft_trace: None,
                payment_amount: None,
                adjustment_amount: None,
                reason_code: Some("50".into()),
                reason_category: Some(reason_category.into()),
                is_denial: true,
            },
            processing_timestamp: at(minute),
        }
    }

    fn stored(minute: u32) -> IndexedRow {
        IndexedRow {
            sequence: at(minute),
            row: json!({"v": minute}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn transitions_follow_sequence_rule() {
        assert_eq!(transition(None, &stored(5)), Transition::Insert);
        assert_eq!(transition(Some(&stored(5)), &stored(6)), Transition::Update);
        assert_eq!(transition(Some(&stored(5)), &stored(5)), Transition::Unchanged);
        assert_eq!(transition(Some(&stored(5)), &stored(4)), Transition::DiscardLate);

        let mut same_seq_new_content = stored(5);
        same_seq_new_content.row.insert("extra".into(), json!(1));
        assert_eq!(
            transition(Some(&stored(5)), &same_seq_new_content),
            Transition::Update
        );
    }

    #[test]
    fn reduce_keeps_newest_and_later_on_ties() {
        let (winners, superseded) = reduce_batch(vec![
            event("a", 5, "first"),
            event("a", 3, "older"),
            event("a", 5, "tie-later"),
            event("b", 1, "only"),
        ]);
        assert_eq!(superseded, 2);
        assert_eq!(winners.len(), 2);
        assert_eq!(
            winners["a"].event.reason_category.as_deref(),
            Some("tie-later")
        );
    }

    #[test]
    fn plan_emits_changes_and_counts() {
        let index = TargetIndex::default();
        let (events, _) = reduce_batch(vec![event("a", 1, "x"), event("b", 1, "x")]);
        let first = plan_merge(&index, events).unwrap();
        assert_eq!(first.counts.inserted, 2);
        assert_eq!(first.changes.len(), 2);
        assert!(first.changes.iter().all(|c| !c.row.contains_key(SEQUENCE_COLUMN)));

        let index = first.index.at_version(1);
        let (events, _) = reduce_batch(vec![
            event("a", 2, "y"),
            event("b", 0, "late"),
        ]);
        let second = plan_merge(&index, events).unwrap();
        assert_eq!(second.counts.updated, 1);
        assert_eq!(second.counts.discarded_late, 1);
        let kinds: Vec<_> = second.changes.iter().map(|c| c.change_type).collect();
        assert_eq!(
            kinds,
            vec![ChangeType::UpdatePreimage, ChangeType::UpdatePostimage]
        );
        assert_eq!(second.index.len(), 2);
        assert_eq!(second.commit_metrics().num_output_rows, 2);

        let (events, _) = reduce_batch(vec![event("a", 2, "y")]);
        let replay = plan_merge(&second.index, events).unwrap();
        assert_eq!(replay.counts.unchanged, 1);
        assert!(replay.changes.is_empty());
    }

    #[test]
    fn index_round_trips_rows_and_rejects_corruption() {
        let (events, _) = reduce_batch(vec![event("a", 1, "x")]);
        let plan = plan_merge(&TargetIndex::default(), events).unwrap();
        let rebuilt =
            TargetIndex::from_rows("gold.fact_denial_event", 3, plan.index.to_rows()).unwrap();
        assert_eq!(rebuilt.version(), 3);
        assert_eq!(rebuilt.get("a"), plan.index.get("a"));

        let mut rows = plan.index.to_rows();
        rows[0].remove(SEQUENCE_COLUMN);
        assert!(matches!(
            TargetIndex::from_rows("gold.fact_denial_event", 3, rows).unwrap_err(),
            Error::CorruptTarget { .. }
        ));
    }
}
