use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::payload::Payload;
use crate::types::WireEnum;

/// Errors that can occur while coercing payload fields.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("invalid timestamp for field '{field}': {value:?} ({source})")]
    InvalidTimestamp {
        field: String,
        value: String,
        source: chrono::ParseError,
    },
}

/// Rewrites every string entry named in `fields` into a timestamp.
///
/// Walks nested objects and objects inside arrays. Empty strings become
/// [`Payload::Null`]; values that are no longer strings are left alone, so
/// running the pass twice is harmless.
pub fn make_fields_datetime(data: &mut Payload, fields: &[&str]) -> Result<(), NormalizerError> {
    match data {
        Payload::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Payload::String(raw) if fields.contains(&key.as_str()) => {
                        let converted = parse_timestamp(key, raw)?;
                        *value = converted;
                    }
                    Payload::Object(_) | Payload::Array(_) => make_fields_datetime(value, fields)?,
                    _ => {}
                }
            }
        }
        Payload::Array(items) => {
            for item in items.iter_mut() {
                make_fields_datetime(item, fields)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rewrites every string entry named in `fields` into a member of `E`.
///
/// Strings outside the enumeration's value set map to `default`.
pub fn fields_to_enum<E: WireEnum>(data: &mut Payload, fields: &[&str], default: E) {
    match data {
        Payload::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Payload::String(raw) if fields.contains(&key.as_str()) => {
                        let member = E::from_wire(raw).unwrap_or(default).member();
                        *value = Payload::Enum(member);
                    }
                    Payload::Object(_) | Payload::Array(_) => {
                        fields_to_enum(value, fields, default)
                    }
                    _ => {}
                }
            }
        }
        Payload::Array(items) => {
            for item in items.iter_mut() {
                fields_to_enum(item, fields, default);
            }
        }
        _ => {}
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<Payload, NormalizerError> {
    if raw.is_empty() {
        return Ok(Payload::Null);
    }

    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|err| {
            // offset-less ISO-8601 values are treated as UTC
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| err)
        })
        .map_err(|source| NormalizerError::InvalidTimestamp {
            field: field.to_string(),
            value: raw.to_string(),
            source,
        })?;

    Ok(Payload::Timestamp(parsed))
}
