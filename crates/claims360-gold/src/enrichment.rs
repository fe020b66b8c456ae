//! Denial event enrichment view (`denial_events_enriched`).
//!
//! Stateless per event: filter to denials, derive the event key, resolve the
//! payer against a point-in-time Claim Fact snapshot, and normalize the
//! output columns. The snapshot is whatever `gold.fact_claim` version is
//! committed when the micro-batch runs, so payer fields may lag the
//! materializer by one cycle.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use claims360_table::{Row, Table, VersionedRow};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event_key::{event_key, parse_timestamp, timestamp_to_string};
use crate::model::{
    ClaimPayer, DenialEvent, EnrichedEvent, PaymentEvent, QuarantineRecord, UNKNOWN_PAYER,
    is_truthy,
};

/// Payer columns of one Claim Fact row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerRef {
    /// Payer id.
    pub payer_id: Option<String>,
    /// Payer name.
    pub payer_name: Option<String>,
}

/// Claim id to payer lookup, built from one Claim Fact snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClaimLookup {
    version: u64,
    payers: HashMap<String, PayerRef>,
}

impl ClaimLookup {
    /// Builds a lookup from Claim Fact rows in snapshot order.
    ///
    /// If a claim id repeats, the first row wins.
    #[must_use]
    pub fn from_rows(version: u64, rows: impl IntoIterator<Item = ClaimPayer>) -> Self {
        let mut payers = HashMap::new();
        let mut duplicates = 0_usize;
        for row in rows {
            match payers.entry(row.claim_id) {
                Entry::Occupied(_) => duplicates += 1,
                Entry::Vacant(slot) => {
                    slot.insert(PayerRef {
                        payer_id: row.payer_id,
                        payer_name: row.payer_name,
                    });
                }
            }
        }
        if duplicates > 0 {
            tracing::warn!(version, duplicates, "duplicate claim ids in claim lookup; first row wins");
        }
        Self { version, payers }
    }

    /// Loads the latest committed Claim Fact snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SourceUnavailable`] if the table cannot be read.
    pub async fn load(fact_claim: &Table) -> Result<Self> {
        let (snapshot, rows) = fact_claim
            .read_as::<ClaimPayer>()
            .await
            .map_err(|e| Error::source_unavailable(fact_claim.name().to_string(), e))?;
        Ok(Self::from_rows(snapshot.version, rows))
    }

    /// Claim Fact version the lookup was built from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of distinct claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payers.len()
    }

    /// Returns true if the lookup holds no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payers.is_empty()
    }

    /// Looks up the payer of `claim_id`.
    #[must_use]
    pub fn get(&self, claim_id: &str) -> Option<&PayerRef> {
        self.payers.get(claim_id)
    }
}

/// Why a denial event was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// `claim_id` is null or absent.
    MissingClaimId,
    /// `posted_ts` is null or absent.
    MissingPostedTs,
    /// `posted_ts` does not parse as a timestamp.
    UnparseablePostedTs(String),
    /// The row does not decode as a payment event.
    Malformed(String),
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingClaimId => f.write_str("claim_id is null"),
            Self::MissingPostedTs => f.write_str("posted_ts is null"),
            Self::UnparseablePostedTs(raw) => write!(f, "posted_ts {raw:?} is not a timestamp"),
            Self::Malformed(message) => write!(f, "malformed event: {message}"),
        }
    }
}

/// A denial event that cannot be keyed or sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEvent {
    /// Source version that appended the event.
    pub source_version: u64,
    /// Rejection reason.
    pub reason: InvalidReason,
    /// The source row.
    pub raw: Row,
}

impl InvalidEvent {
    /// Builds the quarantine row for this event.
    #[must_use]
    pub fn to_quarantine(&self) -> QuarantineRecord {
        let text = |column: &str| match self.raw.get(column) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        QuarantineRecord {
            source_version: self.source_version,
            reason: self.reason.to_string(),
            claim_id: text("claim_id"),
            remit_id: text("remit_id"),
            raw: Value::Object(self.raw.clone()).to_string(),
        }
    }
}

/// Result of enriching one source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Enriched {
    /// A valid denial event.
    Event(EnrichedEvent),
    /// Not a denial; dropped by the filter.
    Filtered,
    /// A denial that cannot be keyed or sequenced.
    Invalid(InvalidEvent),
}

/// Enriches one source row appended at `source_version`.
#[must_use]
pub fn enrich(source_version: u64, row: &Row, lookup: &ClaimLookup) -> Enriched {
    if !is_truthy(row.get("is_denial")) {
        return Enriched::Filtered;
    }

    let invalid = |reason| {
        Enriched::Invalid(InvalidEvent {
            source_version,
            reason,
            raw: row.clone(),
        })
    };

    let event: PaymentEvent = match serde_json::from_value(Value::Object(row.clone())) {
        Ok(event) => event,
        Err(e) => return invalid(InvalidReason::Malformed(e.to_string())),
    };
    let Some(claim_id) = event.claim_id else {
        return invalid(InvalidReason::MissingClaimId);
    };
    let Some(raw_ts) = event.posted_ts else {
        return invalid(InvalidReason::MissingPostedTs);
    };
    let Some(posted_ts) = parse_timestamp(&raw_ts) else {
        return invalid(InvalidReason::UnparseablePostedTs(raw_ts));
    };

    let key = event_key(
        event.remit_id.as_deref(),
        Some(&claim_id),
        Some(&timestamp_to_string(&posted_ts)),
        event.reason_code.as_deref(),
    );

    let payer = lookup.get(&claim_id);
    let payer_id = payer
        .and_then(|p| p.payer_id.clone())
        .or(event.payer_id);
    let payer_name = payer
        .and_then(|p| p.payer_name.clone())
        .unwrap_or_else(|| UNKNOWN_PAYER.to_string());

    Enriched::Event(EnrichedEvent {
        event: DenialEvent {
            event_key: key,
            claim_id,
            payer_id,
            payer_name,
            event_ts: posted_ts,
            payment_date: event.payment_date,
            remit_id: event.remit_id,
            check_or_eft_trace: event.check_or_eft_trace,
            payment_amount: event.payment_amount,
            adjustment_amount: event.adjustment_amount,
            reason_code: event.reason_code,
            reason_category: event.reason_category,
            is_denial: true,
        },
        processing_timestamp: posted_ts,
    })
}

/// Enriched rows of one micro-batch, in stream order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichedBatch {
    /// Valid denial events.
    pub events: Vec<EnrichedEvent>,
    /// Invalid denial events.
    pub invalid: Vec<InvalidEvent>,
    /// Rows dropped by the denial filter.
    pub filtered: usize,
}

/// Enriches a micro-batch of source rows.
#[must_use]
pub fn enrich_batch(rows: &[VersionedRow], lookup: &ClaimLookup) -> EnrichedBatch {
    let mut batch = EnrichedBatch::default();
    for VersionedRow { version, row } in rows {
        match enrich(*version, row, lookup) {
            Enriched::Event(event) => batch.events.push(event),
            Enriched::Invalid(invalid) => batch.invalid.push(invalid),
            Enriched::Filtered => batch.filtered += 1,
        }
    }
    batch
}
