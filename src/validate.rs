use crate::record::{ErrorKind, LogLevel, NormalizedRecord, PositionalError, RawRecord};
use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const MAX_APP_ID_BYTES: usize = 255;
pub const MAX_SOURCE_BYTES: usize = 255;
pub const MAX_METADATA_ENTRY_BYTES: usize = 1024;

/// The outcome of validating one batch. `valid` preserves the input order of
/// the surviving records; `errors` carry the original input index of each
/// rejected record.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub valid: Vec<NormalizedRecord>,
    pub errors: Vec<PositionalError>,
}

/// Validate and normalize a single raw record. Pure: no I/O, input is not
/// mutated, and the server-assigned timestamp comes from the caller. Errors
/// are always reported, never thrown.
pub fn validate(
    raw: &RawRecord,
    index: usize,
    now: DateTime<Utc>,
) -> Result<NormalizedRecord, PositionalError> {
    let Some(fields) = raw.as_object() else {
        return Err(err(index, ErrorKind::WrongType, "record must be an object"));
    };

    let app_id = required_string(fields, "app_id", index, MAX_APP_ID_BYTES)?;
    let message = required_string(fields, "message", index, MAX_MESSAGE_BYTES)?;
    let source = required_string(fields, "source", index, MAX_SOURCE_BYTES)?;

    let level = match fields.get("level") {
        None | Some(Value::Null) => {
            return Err(err(index, ErrorKind::MissingField, "level required"));
        }
        Some(Value::String(raw_level)) => raw_level.parse::<LogLevel>().map_err(|_| {
            err(
                index,
                ErrorKind::InvalidLevel,
                format!("level must be one of DEBUG, INFO, WARN, ERROR, FATAL (got {raw_level:?})"),
            )
        })?,
        Some(_) => return Err(err(index, ErrorKind::WrongType, "level must be a string")),
    };

    let timestamp = match fields.get("timestamp") {
        None | Some(Value::Null) => now,
        Some(Value::String(raw_ts)) => DateTime::parse_from_rfc3339(raw_ts)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|parse_err| {
                err(
                    index,
                    ErrorKind::InvalidTimestamp,
                    format!("timestamp is not ISO-8601: {parse_err}"),
                )
            })?,
        Some(_) => {
            return Err(err(
                index,
                ErrorKind::WrongType,
                "timestamp must be a string",
            ));
        }
    };

    let id = match fields.get("id") {
        None | Some(Value::Null) => Uuid::new_v4(),
        Some(Value::String(raw_id)) => Uuid::parse_str(raw_id).map_err(|parse_err| {
            err(
                index,
                ErrorKind::InvalidId,
                format!("id is not a UUID: {parse_err}"),
            )
        })?,
        Some(_) => return Err(err(index, ErrorKind::WrongType, "id must be a string")),
    };

    let metadata = match fields.get("metadata") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(entries)) => {
            let mut metadata = BTreeMap::new();
            for (key, value) in entries {
                let Value::String(value) = value else {
                    return Err(err(
                        index,
                        ErrorKind::WrongType,
                        format!("metadata value for {key:?} must be a string"),
                    ));
                };
                if key.len() > MAX_METADATA_ENTRY_BYTES || value.len() > MAX_METADATA_ENTRY_BYTES {
                    return Err(err(
                        index,
                        ErrorKind::TooLong,
                        format!("metadata entry {key:?} exceeds {MAX_METADATA_ENTRY_BYTES} bytes"),
                    ));
                }
                metadata.insert(key.clone(), value.clone());
            }
            metadata
        }
        Some(_) => {
            return Err(err(
                index,
                ErrorKind::WrongType,
                "metadata must be an object of strings",
            ));
        }
    };

    let trace_id = optional_string(fields, "trace_id", index)?;
    let user_id = optional_string(fields, "user_id", index)?;

    Ok(NormalizedRecord {
        id,
        app_id,
        message,
        level,
        source,
        timestamp,
        metadata,
        trace_id,
        user_id,
    })
}

/// Validate a whole batch. Order is preserved among the surviving records,
/// every error keeps its original index, and duplicate record ids within the
/// batch reject the later occurrence.
pub fn validate_batch(records: &[RawRecord], now: DateTime<Utc>) -> ValidationOutcome {
    let mut outcome = ValidationOutcome {
        valid: Vec::with_capacity(records.len()),
        errors: Vec::new(),
    };

    let mut seen_ids = HashSet::with_capacity(records.len());
    for (index, raw) in records.iter().enumerate() {
        match validate(raw, index, now) {
            Ok(record) => {
                if !seen_ids.insert(record.id) {
                    outcome.errors.push(err(
                        index,
                        ErrorKind::InvalidId,
                        format!("id {} duplicated within the batch", record.id),
                    ));
                } else {
                    outcome.valid.push(record);
                }
            }
            Err(error) => outcome.errors.push(error),
        }
    }

    outcome
}

fn required_string(
    fields: &serde_json::Map<String, Value>,
    name: &str,
    index: usize,
    max_bytes: usize,
) -> Result<String, PositionalError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(err(
            index,
            ErrorKind::MissingField,
            format!("{name} required"),
        )),
        Some(Value::String(value)) if value.is_empty() => Err(err(
            index,
            ErrorKind::EmptyField,
            format!("{name} must not be empty"),
        )),
        Some(Value::String(value)) if value.len() > max_bytes => Err(err(
            index,
            ErrorKind::TooLong,
            format!("{name} exceeds {max_bytes} bytes"),
        )),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(err(
            index,
            ErrorKind::WrongType,
            format!("{name} must be a string"),
        )),
    }
}

fn optional_string(
    fields: &serde_json::Map<String, Value>,
    name: &str,
    index: usize,
) -> Result<Option<String>, PositionalError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(err(
            index,
            ErrorKind::WrongType,
            format!("{name} must be a string"),
        )),
    }
}

fn err(index: usize, kind: ErrorKind, message: impl Into<String>) -> PositionalError {
    PositionalError {
        index,
        kind,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn minimal() -> RawRecord {
        json!({"app_id": "A", "message": "m", "level": "info", "source": "s"})
    }

    #[test]
    fn minimal_record_normalizes() {
        let record = validate(&minimal(), 0, now()).unwrap();
        assert_eq!(record.app_id, "A");
        assert_eq!(record.level, LogLevel::Info);
        // Server assigns the timestamp when the caller omits it
        assert_eq!(record.timestamp, now());
        assert!(record.metadata.is_empty());
        assert!(record.trace_id.is_none());
    }

    #[test]
    fn missing_message_is_positional() {
        let raw = json!({"app_id": "A", "level": "info", "source": "s"});
        let error = validate(&raw, 7, now()).unwrap_err();
        assert_eq!(error.index, 7);
        assert_eq!(error.kind, ErrorKind::MissingField);
        assert_eq!(error.message, "message required");
    }

    #[test]
    fn level_is_normalized_not_rejected() {
        for raw_level in ["debug", "DEBUG", "Debug", "dEbUg"] {
            let mut raw = minimal();
            raw["level"] = json!(raw_level);
            let record = validate(&raw, 0, now()).unwrap();
            assert_eq!(record.level, LogLevel::Debug);
        }
    }

    #[test]
    fn unknown_level_is_rejected() {
        let mut raw = minimal();
        raw["level"] = json!("verbose");
        let error = validate(&raw, 0, now()).unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidLevel);
    }

    #[test]
    fn length_bounds_are_enforced() {
        let mut raw = minimal();
        raw["message"] = json!("x".repeat(MAX_MESSAGE_BYTES + 1));
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::TooLong
        );

        let mut raw = minimal();
        raw["app_id"] = json!("x".repeat(MAX_APP_ID_BYTES + 1));
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::TooLong
        );

        let mut raw = minimal();
        raw["metadata"] = json!({"key": "v".repeat(MAX_METADATA_ENTRY_BYTES + 1)});
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::TooLong
        );
    }

    #[test]
    fn scalar_metadata_is_a_type_error() {
        let mut raw = minimal();
        raw["metadata"] = json!("not a map");
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::WrongType
        );
    }

    #[test]
    fn supplied_timestamp_and_id_are_kept() {
        let mut raw = minimal();
        raw["timestamp"] = json!("2025-12-31T23:59:59Z");
        raw["id"] = json!("6f1c1a9e-8a3b-4c5d-9e2f-012345678901");
        let record = validate(&raw, 0, now()).unwrap();
        assert_eq!(record.timestamp.to_rfc3339(), "2025-12-31T23:59:59+00:00");
        assert_eq!(
            record.id.to_string(),
            "6f1c1a9e-8a3b-4c5d-9e2f-012345678901"
        );
    }

    #[test]
    fn bad_timestamp_and_id_are_rejected() {
        let mut raw = minimal();
        raw["timestamp"] = json!("not a date");
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::InvalidTimestamp
        );

        let mut raw = minimal();
        raw["id"] = json!("not-a-uuid");
        assert_eq!(
            validate(&raw, 0, now()).unwrap_err().kind,
            ErrorKind::InvalidId
        );
    }

    #[test]
    fn batch_preserves_order_and_indices() {
        let records = vec![
            minimal(),
            json!({"app_id": "A", "level": "info", "source": "s"}),
            json!({"app_id": "B", "message": "m2", "level": "warn", "source": "s"}),
            json!(42),
        ];
        let outcome = validate_batch(&records, now());

        assert_eq!(outcome.valid.len(), 2);
        assert_eq!(outcome.valid[0].app_id, "A");
        assert_eq!(outcome.valid[1].app_id, "B");
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[1].index, 3);
    }

    #[test]
    fn duplicate_ids_within_a_batch_reject_the_later_record() {
        let id = "6f1c1a9e-8a3b-4c5d-9e2f-012345678901";
        let mut first = minimal();
        first["id"] = json!(id);
        let mut second = minimal();
        second["id"] = json!(id);

        let outcome = validate_batch(&[first, second], now());
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert_eq!(outcome.errors[0].kind, ErrorKind::InvalidId);
    }

    #[test]
    fn input_is_not_mutated() {
        let raw = minimal();
        let before = raw.clone();
        let _ = validate(&raw, 0, now());
        assert_eq!(raw, before);
    }
}
