//! Table definitions for the pipeline's inputs and outputs.

use claims360_core::ScopedStorage;
use claims360_table::{
    Column, DataType, Table, TableMetadata, TableName, TableProperties, TableSchema,
};

use crate::error::Result;

/// `silver.curated_claims`.
pub const CURATED_CLAIMS: &str = "silver.curated_claims";
/// `silver.payments_835_events`.
pub const PAYMENT_EVENTS: &str = "silver.payments_835_events";
/// `gold.fact_claim`.
pub const FACT_CLAIM: &str = "gold.fact_claim";
/// `gold.fact_denial_event`.
pub const FACT_DENIAL_EVENT: &str = "gold.fact_denial_event";
/// `gold.denial_event_quarantine`.
pub const DENIAL_EVENT_QUARANTINE: &str = "gold.denial_event_quarantine";

fn name(qualified: &str) -> Result<TableName> {
    Ok(qualified.parse()?)
}

fn claim_columns() -> Vec<Column> {
    use DataType::{Boolean, Date, Decimal, String, Timestamp};
    vec![
        Column::required("claim_id", String),
        Column::nullable("payer_id", String),
        Column::nullable("payer_name", String),
        Column::nullable("patient_id", String),
        Column::nullable("encounter_id", String),
        Column::nullable("submission_date", Date),
        Column::nullable("billed_amount", Decimal),
        Column::nullable("expected_amount", Decimal),
        Column::nullable("net_paid_to_date", Decimal),
        Column::nullable("adjustments_to_date", Decimal),
        Column::nullable("current_balance", Decimal),
        Column::nullable("has_denial_any", Boolean),
        Column::nullable("had_277_reject", Boolean),
        Column::nullable("last_payment_ts", Timestamp),
    ]
}

/// Curated claims (Silver input, owned upstream).
///
/// # Errors
///
/// Never fails for the built-in name; the `Result` covers name validation.
pub fn curated_claims() -> Result<TableMetadata> {
    Ok(TableMetadata::new(name(CURATED_CLAIMS)?, TableSchema::new(claim_columns()))
        .with_comment("Curated claims")
        .with_properties(TableProperties::quality("silver")))
}

/// Payment/remittance events (Silver input, append-only, owned upstream).
///
/// `posted_ts` is kept as received so unparseable values reach the
/// enrichment view's invalid-event policy instead of failing the upstream
/// append.
///
/// # Errors
///
/// Never fails for the built-in name; the `Result` covers name validation.
pub fn payment_events() -> Result<TableMetadata> {
    use DataType::{Boolean, Date, Decimal, String};
    let schema = TableSchema::new(vec![
        Column::nullable("claim_id", String),
        Column::nullable("payer_id", String),
        Column::nullable("remit_id", String),
        Column::nullable("check_or_eft_trace", String),
        Column::nullable("posted_ts", String),
        Column::nullable("payment_date", Date),
        Column::nullable("payment_amount", Decimal),
        Column::nullable("adjustment_amount", Decimal),
        Column::nullable("reason_code", String),
        Column::nullable("reason_category", String),
        Column::nullable("is_denial", Boolean),
    ]);
    Ok(TableMetadata::new(name(PAYMENT_EVENTS)?, schema)
        .with_comment("835 payment and adjustment events")
        .with_properties(TableProperties::quality("silver")))
}

/// Claim fact (full refresh).
///
/// # Errors
///
/// Never fails for the built-in name; the `Result` covers name validation.
pub fn fact_claim() -> Result<TableMetadata> {
    Ok(TableMetadata::new(name(FACT_CLAIM)?, TableSchema::new(claim_columns()))
        .with_comment("Claim fact table - fully refreshed from silver curated_claims")
        .with_properties(TableProperties::quality("gold").with_auto_optimize()))
}

/// Denial events (CDC merge target).
///
/// # Errors
///
/// Never fails for the built-in name; the `Result` covers name validation.
pub fn fact_denial_event() -> Result<TableMetadata> {
    use DataType::{Boolean, Date, Decimal, String, Timestamp};
    let schema = TableSchema::new(vec![
        Column::required("event_key", String),
        Column::required("claim_id", String),
        Column::nullable("payer_id", String),
        Column::required("payer_name", String),
        Column::required("event_ts", Timestamp),
        Column::nullable("payment_date", Date),
        Column::nullable("remit_id", String),
        Column::nullable("check_or_eft_trace", String),
        Column::nullable("payment_amount", Decimal),
        Column::nullable("adjustment_amount", Decimal),
        Column::nullable("reason_code", String),
        Column::nullable("reason_category", String),
        Column::required("is_denial", Boolean),
    ]);
    Ok(TableMetadata::new(name(FACT_DENIAL_EVENT)?, schema)
        .with_comment("Denial events with upsert logic - one row per unique denial event")
        .with_properties(TableProperties::quality("gold").with_change_data_feed()))
}

/// Quarantined denial events.
///
/// # Errors
///
/// Never fails for the built-in name; the `Result` covers name validation.
pub fn denial_event_quarantine() -> Result<TableMetadata> {
    use DataType::{Integer, String};
    let schema = TableSchema::new(vec![
        Column::required("source_version", Integer),
        Column::required("reason", String),
        Column::nullable("claim_id", String),
        Column::nullable("remit_id", String),
        Column::required("raw", String),
    ]);
    Ok(TableMetadata::new(name(DENIAL_EVENT_QUARANTINE)?, schema)
        .with_comment("Denial events that could not be keyed or sequenced")
        .with_properties(TableProperties::quality("gold")))
}

/// Handles to every table the pipeline touches.
#[derive(Debug, Clone)]
pub struct PipelineTables {
    /// `silver.curated_claims`.
    pub curated_claims: Table,
    /// `silver.payments_835_events`.
    pub payment_events: Table,
    /// `gold.fact_claim`.
    pub fact_claim: Table,
    /// `gold.fact_denial_event`.
    pub fact_denial_event: Table,
    /// `gold.denial_event_quarantine`.
    pub quarantine: Table,
}

impl PipelineTables {
    /// Creates any missing table and opens all of them.
    ///
    /// # Errors
    ///
    /// Returns a conflict if an existing table was created with different
    /// metadata, and storage errors otherwise.
    pub async fn ensure(storage: &ScopedStorage) -> Result<Self> {
        Ok(Self {
            curated_claims: Table::create(storage.clone(), curated_claims()?).await?,
            payment_events: Table::create(storage.clone(), payment_events()?).await?,
            fact_claim: Table::create(storage.clone(), fact_claim()?).await?,
            fact_denial_event: Table::create(storage.clone(), fact_denial_event()?).await?,
            quarantine: Table::create(storage.clone(), denial_event_quarantine()?).await?,
        })
    }

    /// All tables, inputs first.
    #[must_use]
    pub fn all(&self) -> [&Table; 5] {
        [
            &self.curated_claims,
            &self.payment_events,
            &self.fact_claim,
            &self.fact_denial_event,
            &self.quarantine,
        ]
    }

    /// Tables fed from outside the pipeline.
    #[must_use]
    pub fn sources(&self) -> [&Table; 2] {
        [&self.curated_claims, &self.payment_events]
    }

    /// Looks up a source table by qualified name.
    ///
    /// Gold tables have exactly one writer, their stage, and are never
    /// returned here.
    #[must_use]
    pub fn source_by_name(&self, qualified: &str) -> Option<&Table> {
        self.sources()
            .into_iter()
            .find(|t| t.name().to_string() == qualified)
    }
}
