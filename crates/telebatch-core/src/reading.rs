//! Readings and the batch wire format.
//!
//! A batch is the JSON array of readings exactly as they sat in the device
//! buffer, oldest first. Devices post readings as flat JSON objects; the
//! `deviceId` key is the only required field.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{UploadError, ValidationError};

/// One sensor observation tagged with its device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Reading {
    /// Create a reading stamped with the current time.
    #[must_use]
    pub fn new(device_id: impl Into<String>, payload: Value) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Create a reading with an explicit timestamp.
    #[must_use]
    pub fn with_timestamp(
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            payload,
        }
    }

    /// Check the device id. Whitespace-only ids are rejected like empty ones.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_device_id(&self.device_id)
    }

    /// Build a reading from a raw device post.
    ///
    /// `timestamp` may be an RFC 3339 string or epoch milliseconds; when
    /// absent the reading is stamped now. The payload is the `payload` key
    /// when present, otherwise every remaining field.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut fields) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let device_id = match fields.remove("deviceId") {
            None | Some(Value::Null) => return Err(ValidationError::MissingDeviceId),
            Some(Value::String(id)) => id,
            Some(_) => return Err(ValidationError::InvalidDeviceId),
        };
        validate_device_id(&device_id)?;

        let timestamp = match fields.remove("timestamp") {
            None | Some(Value::Null) => Utc::now(),
            Some(raw) => parse_timestamp(&raw)?,
        };

        let payload = match fields.remove("payload") {
            Some(payload) if fields.is_empty() => payload,
            Some(payload) => {
                fields.insert("payload".to_string(), payload);
                Value::Object(fields)
            }
            None => Value::Object(fields),
        };

        Ok(Self {
            device_id,
            timestamp,
            payload,
        })
    }
}

pub(crate) fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.trim().is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }
    Ok(())
}

fn parse_timestamp(raw: &Value) -> Result<DateTime<Utc>, ValidationError> {
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| ValidationError::InvalidTimestamp(format!("{text}: {e}"))),
        Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| ValidationError::InvalidTimestamp(number.to_string())),
        other => Err(ValidationError::InvalidTimestamp(other.to_string())),
    }
}

/// Serialize a batch snapshot for upload.
pub fn encode_batch(readings: &[Reading]) -> Result<Vec<u8>, UploadError> {
    serde_json::to_vec(readings).map_err(|e| UploadError::Encode(e.to_string()))
}

/// Parse bytes previously produced by [`encode_batch`].
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Reading>, UploadError> {
    serde_json::from_slice(bytes).map_err(|e| UploadError::Decode(e.to_string()))
}
