use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::{Duration, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Fixed reference instant for EMG sample timestamps. Wire `timestamp`
/// values are millisecond offsets from this epoch, not from the Unix epoch.
pub const EMG_EPOCH: OffsetDateTime = datetime!(2025-06-22 00:00 UTC);

/// One EMG sample as submitted by a sensor client.
///
/// Both fields are required; a payload missing either (or carrying a wrong
/// type) fails deserialization and never reaches storage. `rawValue` is an
/// exact decimal: JSON numbers are parsed with arbitrary precision rather
/// than through `f64`, and decimal strings are accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EmgRecord {
    pub timestamp: i64,
    #[serde(rename = "rawValue")]
    pub raw_value: Decimal,
}

impl EmgRecord {
    /// Resolves the sample's wall-clock instant against [`EMG_EPOCH`].
    ///
    /// Returns `None` when the offset overflows the representable datetime
    /// range; such records are still accepted and stored verbatim.
    #[must_use]
    pub fn occurred_at(&self) -> Option<OffsetDateTime> {
        EMG_EPOCH.checked_add(Duration::milliseconds(self.timestamp))
    }
}

/// One persisted EMG sample. `id` is assigned by the store, `created_at`
/// by the Storage Writer at insert time; `timestamp` and `raw_value` are
/// copied verbatim from the input record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EmgRecordRow {
    pub id: i64,
    pub timestamp: i64,
    pub raw_value: Decimal,
    pub created_at: OffsetDateTime,
}

/// Parses an RFC3339 timestamp, requiring the UTC offset.
///
/// # Errors
/// Returns [`IngestError::Validation`] when parsing fails or the offset is
/// not Z.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IngestError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IngestError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IngestError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IngestError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IngestError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IngestError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
