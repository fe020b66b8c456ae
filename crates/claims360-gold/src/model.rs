//! Typed rows for the Silver inputs and Gold outputs.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use claims360_table::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payer fallback when a claim is not found in the lookup.
pub const UNKNOWN_PAYER: &str = "Unknown";

/// Hidden column holding the stored sequence value of a merged row.
pub const SEQUENCE_COLUMN: &str = "__upsert_sequence";

/// One row of `gold.fact_claim`, projected from `silver.curated_claims`.
///
/// Deserializing a curated row into this type is the projection: columns
/// outside the fixed set are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFact {
    /// Business key.
    pub claim_id: String,
    /// Payer id.
    #[serde(default)]
    pub payer_id: Option<String>,
    /// Payer display name.
    #[serde(default)]
    pub payer_name: Option<String>,
    /// Patient id.
    #[serde(default)]
    pub patient_id: Option<String>,
    /// Encounter id.
    #[serde(default)]
    pub encounter_id: Option<String>,
    /// Claim submission date.
    #[serde(default)]
    pub submission_date: Option<NaiveDate>,
    /// Billed amount.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub billed_amount: Option<Decimal>,
    /// Expected (contracted) amount.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub expected_amount: Option<Decimal>,
    /// Net paid to date.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub net_paid_to_date: Option<Decimal>,
    /// Adjustments to date.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub adjustments_to_date: Option<Decimal>,
    /// Outstanding balance.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub current_balance: Option<Decimal>,
    /// Any denial seen on the claim.
    #[serde(default, deserialize_with = "flex::flag")]
    pub has_denial_any: Option<bool>,
    /// Rejected by a 277 acknowledgement.
    #[serde(default, deserialize_with = "flex::flag")]
    pub had_277_reject: Option<bool>,
    /// Most recent payment time.
    #[serde(default)]
    pub last_payment_ts: Option<DateTime<Utc>>,
}

/// The lookup columns of a Claim Fact row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClaimPayer {
    /// Business key.
    pub claim_id: String,
    /// Payer id.
    #[serde(default)]
    pub payer_id: Option<String>,
    /// Payer display name.
    #[serde(default)]
    pub payer_name: Option<String>,
}

/// A raw row of `silver.payments_835_events`, after the denial filter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentEvent {
    /// Claim the payment applies to.
    #[serde(default)]
    pub claim_id: Option<String>,
    /// Payer id as reported on the remittance.
    #[serde(default)]
    pub payer_id: Option<String>,
    /// Remittance id.
    #[serde(default)]
    pub remit_id: Option<String>,
    /// Check number or EFT trace.
    #[serde(default)]
    pub check_or_eft_trace: Option<String>,
    /// Posting time, as received.
    #[serde(default)]
    pub posted_ts: Option<String>,
    /// Payment date.
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
    /// Paid amount.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub payment_amount: Option<Decimal>,
    /// Adjustment amount.
    #[serde(default, deserialize_with = "flex::decimal")]
    pub adjustment_amount: Option<Decimal>,
    /// CARC/RARC reason code.
    #[serde(default)]
    pub reason_code: Option<String>,
    /// Reason category.
    #[serde(default)]
    pub reason_category: Option<String>,
}

/// One row of `gold.fact_denial_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialEvent {
    /// Deterministic identity (primary key).
    pub event_key: String,
    /// Claim id.
    pub claim_id: String,
    /// Payer id: the Claim Fact payer, else the event's own.
    #[serde(default)]
    pub payer_id: Option<String>,
    /// Payer name: the Claim Fact payer name, else [`UNKNOWN_PAYER`].
    pub payer_name: String,
    /// Posting time.
    pub event_ts: DateTime<Utc>,
    /// Payment date.
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
    /// Remittance id.
    #[serde(default)]
    pub remit_id: Option<String>,
    /// Check number or EFT trace.
    #[serde(default)]
    pub check_or_eft_trace: Option<String>,
    /// Paid amount.
    #[serde(default)]
    pub payment_amount: Option<Decimal>,
    /// Adjustment amount.
    #[serde(default)]
    pub adjustment_amount: Option<Decimal>,
    /// Reason code.
    #[serde(default)]
    pub reason_code: Option<String>,
    /// Reason category.
    #[serde(default)]
    pub reason_category: Option<String>,
    /// Denial flag.
    pub is_denial: bool,
}

/// Output record of the enrichment view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedEvent {
    /// The normalized denial event.
    #[serde(flatten)]
    pub event: DenialEvent,
    /// Sequence value for the merge (the posting time, not wall clock).
    #[serde(rename = "_processing_timestamp")]
    pub processing_timestamp: DateTime<Utc>,
}

impl EnrichedEvent {
    /// Event key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.event.event_key
    }

    /// Builds the stored target row: the event columns plus the hidden
    /// sequence column.
    ///
    /// # Errors
    ///
    /// Returns an error if the event does not serialize to an object.
    pub fn to_target_row(&self) -> Result<Row> {
        let mut row = to_row(&self.event)?;
        row.insert(
            SEQUENCE_COLUMN.to_string(),
            serde_json::Value::String(
                self.processing_timestamp
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        );
        Ok(row)
    }
}

/// One row of `gold.denial_event_quarantine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Source table version that committed the event.
    pub source_version: u64,
    /// Why the event was rejected.
    pub reason: String,
    /// Claim id, if present.
    #[serde(default)]
    pub claim_id: Option<String>,
    /// Remittance id, if present.
    #[serde(default)]
    pub remit_id: Option<String>,
    /// The source row as JSON text.
    pub raw: String,
}

/// Serializes a record into a table row.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if `value` does not serialize to a JSON
/// object.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(row)) => Ok(row),
        Ok(other) => Err(Error::serialization(format!(
            "record serialized to {other}, not an object"
        ))),
        Err(e) => Err(Error::serialization(format!("record does not serialize: {e}"))),
    }
}

/// Returns true if a raw flag value reads as set.
///
/// Accepts booleans, `0`/`1`, and the strings `true`/`false`/`0`/`1`.
#[must_use]
pub fn is_truthy(value: Option<&serde_json::Value>) -> bool {
    flex::parse_flag(value).unwrap_or(false)
}

/// Lenient deserializers for Silver columns whose encoding varies between
/// sources.
mod flex {
    use std::str::FromStr;

    use rust_decimal::Decimal;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub(super) fn decimal<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Decimal>, D::Error> {
        match Value::deserialize(de)? {
            Value::Null => Ok(None),
            Value::String(s) => Decimal::from_str(s.trim())
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid decimal {s:?}: {e}"))),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid decimal {n}: {e}"))),
            other => Err(D::Error::custom(format!("expected a decimal, got {other}"))),
        }
    }

    pub(super) fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
        let value = Value::deserialize(de)?;
        if value.is_null() {
            return Ok(None);
        }
        parse_flag(Some(&value))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected a boolean flag, got {value}")))
    }

    pub(super) fn parse_flag(value: Option<&Value>) -> Option<bool> {
        match value? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}
