//! Probe message codec.
//!
//! Wire format: a UTF-8 JSON object with exactly three keys, `producerId`
//! (string), `messageId` (string of decimal digits) and `timestamp` (number,
//! milliseconds since the Unix epoch). Unknown keys are ignored on decode.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CanaryError;

/// One probe record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeMessage {
    /// Client id of the producing canary.
    pub producer_id: String,
    /// Equal to the partition the record was sent to.
    #[serde(serialize_with = "to_digits", deserialize_with = "from_digits")]
    pub message_id: i32,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ProbeMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(producer_id: impl Into<String>, message_id: i32) -> Self {
        Self {
            producer_id: producer_id.into(),
            message_id,
            timestamp: now_ms(),
        }
    }

    /// Serializes the message to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::Internal` if serialization fails.
    pub fn encode(&self) -> Result<String, CanaryError> {
        serde_json::to_string(self)
            .map_err(|e| CanaryError::Internal(format!("failed to encode probe message: {e}")))
    }

    /// Parses a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::MalformedMessage` if a field is missing or has the wrong type.
    pub fn decode(payload: &[u8]) -> Result<Self, CanaryError> {
        serde_json::from_slice(payload).map_err(|e| CanaryError::MalformedMessage(e.to_string()))
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn to_digits<S: Serializer>(id: &i32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.to_string())
}

fn from_digits<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(serde::de::Error::custom(format!(
            "messageId must be a string of decimal digits, got '{raw}'"
        )));
    }
    raw.parse::<i32>().map_err(serde::de::Error::custom)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}
