//! ==============================================================================
//! domain.rs - shared data model
//! ==============================================================================
//!
//! purpose:
//!     the types that flow between the parser, the store, the arbiter and the
//!     broadcast hub. a `Measurement` is created once (by the line parser or the
//!     push endpoint), never mutated, only superseded by a newer one.
//!
//! relationships:
//!     - created by: parser.rs (local), gateway.rs (remote)
//!     - persisted by: store.rs (as `StoredRow`)
//!     - fanned out by: hub.rs (wrapped in `LiveEvent`)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Rejection;
use crate::validate;

/// where a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// pushed over http by a network producer
    Remote,
    /// read from the attached serial device
    Local,
    /// answered from the sample store (also used for rows with no origin tag)
    Persisted,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Remote => "remote",
            Source::Local => "local",
            Source::Persisted => "persisted",
        }
    }

    /// maps a stored or pushed tag back to a source; unknown tags are `Persisted`
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "remote" => Source::Remote,
            "local" => Source::Local,
            _ => Source::Persisted,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// one validated temperature/humidity sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// temperature in celsius, always within [-50, 80]
    pub temperature: f64,
    /// relative humidity in percent, always within [0, 100]
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    /// original payload, kept for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Measurement {
    /// builds a measurement, refusing values outside the plausible range
    pub fn checked(
        temperature: f64,
        humidity: f64,
        timestamp: DateTime<Utc>,
        source: Source,
        raw: Option<String>,
    ) -> Result<Self, Rejection> {
        if !validate::is_plausible(temperature, humidity) {
            return Err(Rejection::OutOfRange);
        }
        Ok(Self { temperature, humidity, timestamp, source, raw })
    }

    /// age relative to `now`; negative when the producer's clock runs ahead
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

/// a measurement as it sits in the store, with its row id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub id: i64,
    #[serde(flatten)]
    pub measurement: Measurement,
}

/// answer to "what is the current reading"
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Current {
    /// which arbitration rule produced the reading
    pub method: Source,
    pub reading: Measurement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Error,
}

/// a human-readable line from the device that carried no measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub level: StatusLevel,
    pub timestamp: DateTime<Utc>,
}

/// what live subscribers receive
///
/// serialized as `{"type": "...", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum LiveEvent {
    /// snapshot sent once, right after attaching
    Initial(Measurement),
    /// every accepted sample, from either source
    Reading(Measurement),
    /// device status lines, never stored or arbitrated
    Status(StatusMessage),
}
