//! Timestamp helpers.
//!
//! All persisted timestamps are Unix milliseconds in `u64`. Some legacy
//! metadata written by earlier versions stored `{ seconds, nanoseconds }`
//! pairs; `de_timestamp_ms` accepts both shapes and canonicalizes to ms.

use serde::{Deserialize, Deserializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix milliseconds since epoch.
pub type TimestampMs = u64;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    Millis(u64),
    Legacy { seconds: u64, nanoseconds: u32 },
}

/// Deserialize a timestamp from either canonical ms or a legacy
/// `{ seconds, nanoseconds }` pair.
pub fn de_timestamp_ms<'de, D>(deserializer: D) -> Result<TimestampMs, D::Error>
where
    D: Deserializer<'de>,
{
    match TimestampRepr::deserialize(deserializer)? {
        TimestampRepr::Millis(ms) => Ok(ms),
        TimestampRepr::Legacy {
            seconds,
            nanoseconds,
        } => Ok(seconds * 1000 + u64::from(nanoseconds) / 1_000_000),
    }
}
