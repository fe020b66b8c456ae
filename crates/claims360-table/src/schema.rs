//! Table schemas and row validation.
//!
//! Every write validates its rows before any file is written, so a schema
//! violation never leaves a partial commit behind.
//!
//! Columns whose name starts with `_` are metadata columns (ingest stamps,
//! the hidden merge sequence) and are accepted without being declared.

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Row;

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// UTF-8 string.
    String,
    /// Boolean. Integer flags `0`/`1` are accepted as well.
    Boolean,
    /// 64-bit signed integer.
    Integer,
    /// Fixed-point decimal, stored as a string (numbers are accepted).
    Decimal,
    /// Calendar date, `YYYY-MM-DD`.
    Date,
    /// RFC 3339 timestamp.
    Timestamp,
}

impl DataType {
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_)) | (Self::Boolean, Value::Bool(_)) => true,
            (Self::Boolean, Value::Number(n)) => matches!(n.as_i64(), Some(0 | 1)),
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Decimal, Value::Number(_)) => true,
            (Self::Decimal, Value::String(s)) => s.parse::<Decimal>().is_ok(),
            (Self::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            (Self::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Data type.
    pub data_type: DataType,
    /// Whether null/absent values are allowed.
    pub nullable: bool,
}

impl Column {
    /// A nullable column.
    #[must_use]
    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// A non-nullable column.
    #[must_use]
    pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }
}

/// An ordered set of columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns in declaration order.
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Creates a schema from columns.
    #[must_use]
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Validates one row.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation: a missing required
    /// column, an undeclared non-metadata column, or an incompatible value.
    pub fn validate_row(&self, row: &Row) -> std::result::Result<(), String> {
        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Value::Null) if !column.nullable => {
                    return Err(format!("{} is required", column.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !column.data_type.accepts(value) => {
                    return Err(format!(
                        "{} expects {:?}, got {value}",
                        column.name, column.data_type
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(extra) = row
            .keys()
            .find(|k| !k.starts_with('_') && self.column(k).is_none())
        {
            return Err(format!("{extra} is not a column of this table"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            Column::required("claim_id", DataType::String),
            Column::nullable("billed_amount", DataType::Decimal),
            Column::nullable("is_denial", DataType::Boolean),
            Column::nullable("submission_date", DataType::Date),
            Column::nullable("posted_ts", DataType::Timestamp),
        ])
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn accepts_valid_row_with_metadata_columns() {
        let r = row(json!({
            "claim_id": "C1",
            "billed_amount": "125.40",
            "is_denial": 1,
            "submission_date": "2024-01-05",
            "posted_ts": "2024-01-06T10:00:00Z",
            "_ingest_file": "remit_835/part-0.json",
        }));
        assert!(schema().validate_row(&r).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = schema()
            .validate_row(&row(json!({"claim_id": null})))
            .unwrap_err();
        assert!(err.contains("claim_id is required"));
    }

    #[test]
    fn rejects_incompatible_types() {
        for bad in [
            json!({"claim_id": "C1", "billed_amount": "abc"}),
            json!({"claim_id": "C1", "is_denial": 2}),
            json!({"claim_id": "C1", "submission_date": "05/01/2024"}),
            json!({"claim_id": "C1", "posted_ts": "yesterday"}),
            json!({"claim_id": 7}),
        ] {
            assert!(schema().validate_row(&row(bad.clone())).is_err(), "{bad}");
        }
    }

    #[test]
    fn rejects_undeclared_column() {
        let err = schema()
            .validate_row(&row(json!({"claim_id": "C1", "surprise": 1})))
            .unwrap_err();
        assert!(err.contains("surprise"));
    }
}
