use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::EnumString;
use uuid::Uuid;

/// A record as submitted by a caller: an arbitrary JSON value. Shape checks
/// happen in validation so that one malformed record surfaces as a
/// positional error instead of failing the whole call at the deserializer.
pub type RawRecord = serde_json::Value;

/// Severity levels accepted on the wire, case-insensitively.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, strum::Display,
)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A record that passed validation. Serializes to exactly the row shape the
/// columnar store ingests: `level` uppercased, `timestamp` concrete,
/// `metadata` always an object. `metadata` is a BTreeMap so a given record
/// always serializes to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: Uuid,
    pub app_id: String,
    pub message: String,
    pub level: LogLevel,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Why a single record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum ErrorKind {
    MissingField,
    EmptyField,
    WrongType,
    InvalidLevel,
    TooLong,
    InvalidTimestamp,
    InvalidId,
}

/// A rejection tied to the offending record's offset in the caller's input
/// array, so a partial batch can still make progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionalError {
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

/// Caller-facing per-error entry; `errors` in [`IngestResult`] is truncated
/// to [`MAX_REPORTED_ERRORS`] entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResultError {
    pub index: usize,
    pub error: String,
}

pub const MAX_REPORTED_ERRORS: usize = 100;

/// The caller-facing outcome of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<IngestResultError>,
    pub processing_time_ms: u64,
    pub throughput: f64,
}

impl IngestResult {
    /// Status code an HTTP adapter wrapping the pipeline should answer with:
    /// 202 when anything was accepted, 400 when everything was rejected.
    /// Infrastructure failures never produce an `IngestResult` and map to
    /// 500 in the adapter instead.
    pub fn http_status(&self) -> u16 {
        if self.accepted >= 1 { 202 } else { 400 }
    }

    pub fn from_errors(
        total: usize,
        errors: &[PositionalError],
        processing_time: std::time::Duration,
    ) -> IngestResult {
        let accepted = total - errors.len();
        let mut reported: Vec<IngestResultError> = errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .map(|err| IngestResultError {
                index: err.index,
                error: err.message.clone(),
            })
            .collect();
        reported.shrink_to_fit();

        let processing_time_ms = processing_time.as_millis() as u64;
        let throughput = if processing_time.as_secs_f64() > 0.0 {
            accepted as f64 / processing_time.as_secs_f64()
        } else {
            0.0
        };

        IngestResult {
            accepted,
            rejected: errors.len(),
            errors: reported,
            processing_time_ms,
            throughput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Fatal".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Error).unwrap(), "\"ERROR\"");
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
    }

    #[test]
    fn normalized_record_row_shape() {
        let record = NormalizedRecord {
            id: Uuid::nil(),
            app_id: "app".to_string(),
            message: "hello".to_string(),
            level: LogLevel::Info,
            source: "api".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            metadata: BTreeMap::from([("k".to_string(), "v".to_string())]),
            trace_id: None,
            user_id: Some("u1".to_string()),
        };

        let row = serde_json::to_value(&record).unwrap();
        assert_eq!(row["level"], "INFO");
        // metadata is an object, never a scalar
        assert!(row["metadata"].is_object());
        // absent optionals are omitted from the row entirely
        assert!(row.get("trace_id").is_none());
        assert_eq!(row["user_id"], "u1");
    }

    #[test]
    fn ingest_result_accounts_for_every_record() {
        let errors = vec![PositionalError {
            index: 3,
            kind: ErrorKind::MissingField,
            message: "message required".to_string(),
        }];
        let result = IngestResult::from_errors(10, &errors, Duration::from_millis(20));

        assert_eq!(result.accepted, 9);
        assert_eq!(result.rejected, 1);
        assert_eq!(result.accepted + result.rejected, 10);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 3);
        assert!(result.throughput > 0.0);
    }

    #[test]
    fn http_status_mapping() {
        let accepted = IngestResult::from_errors(3, &[], Duration::from_millis(1));
        assert_eq!(accepted.http_status(), 202);

        let errors: Vec<PositionalError> = (0..2)
            .map(|index| PositionalError {
                index,
                kind: ErrorKind::MissingField,
                message: "app_id required".to_string(),
            })
            .collect();
        let rejected = IngestResult::from_errors(2, &errors, Duration::from_millis(1));
        assert_eq!(rejected.http_status(), 400);

        let partial = IngestResult::from_errors(2, &errors[..1], Duration::from_millis(1));
        assert_eq!(partial.http_status(), 202);
    }

    #[test]
    fn reported_errors_are_truncated() {
        let errors: Vec<PositionalError> = (0..250)
            .map(|index| PositionalError {
                index,
                kind: ErrorKind::EmptyField,
                message: "message must not be empty".to_string(),
            })
            .collect();
        let result = IngestResult::from_errors(250, &errors, Duration::from_millis(1));

        assert_eq!(result.rejected, 250);
        assert_eq!(result.errors.len(), MAX_REPORTED_ERRORS);
    }
}
