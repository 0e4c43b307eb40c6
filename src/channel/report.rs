//! Report records and queries.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// One crowd-sourced sighting of a key.
///
/// Only [`id`][Self::id] matters for decoding; it is the base64 hash of the sighted key.
/// The remaining fields are carried along untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    /// Base64 hash of the reported key.
    pub id: String,

    /// Publication time, milliseconds since the epoch.
    #[serde(default)]
    pub date_published: Option<i64>,

    /// Encrypted location payload, base64.
    #[serde(default)]
    pub payload: Option<String>,

    /// Free-form status text from the service.
    #[serde(default)]
    pub description: Option<String>,

    /// Per-record status from the service.
    #[serde(default)]
    pub status_code: Option<i64>,
}

impl ReportRecord {
    /// Creates a record carrying only a key hash.
    #[must_use]
    pub fn for_hash(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date_published: None,
            payload: None,
            description: None,
            status_code: None,
        }
    }
}

/// A batched lookup of key hashes over a time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportQuery {
    /// Base64 key hashes, in key discovery order.
    pub hashes: Vec<String>,

    /// Start of the time range.
    pub start: DateTime<Utc>,

    /// Length of the time range.
    pub duration: Duration,
}

impl ReportQuery {
    /// Creates a query covering `lookback` up to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `lookback` does not fit a calendar duration.
    pub fn ending_at(hashes: Vec<String>, now: DateTime<Utc>, lookback: Duration) -> Result<Self> {
        let delta = chrono::TimeDelta::from_std(lookback)
            .map_err(|e| Error::InvalidConfig(format!("lookback: {e}")))?;
        let start = now
            .checked_sub_signed(delta)
            .ok_or_else(|| Error::InvalidConfig("lookback reaches before the epoch".into()))?;

        Ok(Self {
            hashes,
            start,
            duration: lookback,
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    results: Vec<serde_json::Value>,
}

/// Parses the service's `{"results": [...]}` envelope.
///
/// Records that do not parse are logged and dropped; the rest are returned in order.
///
/// # Errors
///
/// Returns [`Error::MalformedReportPayload`] if the envelope itself is unreadable.
///
/// # Examples
///
/// ```
/// use crowdbits::channel::report::parse_results;
///
/// let records = parse_results(br#"{"results": [{"id": "abc="}, {"bogus": 1}]}"#)?;
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].id, "abc=");
/// # Ok::<(), crowdbits::Error>(())
/// ```
pub fn parse_results(json: &[u8]) -> Result<Vec<ReportRecord>> {
    let envelope: Envelope = serde_json::from_slice(json)?;

    let records = envelope
        .results
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                let err = Error::MalformedReportPayload(e.to_string());
                warn!(index, error = %err, "dropping report");
                None
            }
        })
        .collect();

    Ok(records)
}
