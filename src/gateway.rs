//! ==============================================================================
//! gateway.rs - ingestion pipeline
//! ==============================================================================
//!
//! purpose:
//!     the one place where a measurement becomes "accepted". both inputs end up
//!     in `accept`, which runs the same three steps in order:
//!
//! ```text
//!         store.append ──► arbiter.record ──► hub.publish
//!
//!     if the append fails nothing else happens: a sample we could not record
//!     is never made current and never broadcast.
//! ```
//!
//! ordering:
//!     each source has its own lane (an async mutex held across the three
//!     steps), so samples from one source are published in acceptance order
//!     even when several pushes arrive at once.
//!
//! relationships:
//!     - used by: server.rs (push + queries), main.rs (local ingest task)
//!     - owns handles to: store.rs, arbiter.rs, hub.rs
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::arbiter::SourceArbiter;
use crate::config::TimestampPolicy;
use crate::domain::{Current, LiveEvent, Measurement, Source, StatusLevel, StoredRow};
use crate::error::{IngestError, Rejection, StoreError};
use crate::hub::{BroadcastHub, Subscription};
use crate::parser::ParsedLine;
use crate::store::SampleStore;
use crate::validate;

/// an externally pushed reading before validation; every field is raw text
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushRequest {
    #[serde(default, alias = "t", alias = "temp")]
    pub temperature: Option<String>,
    #[serde(default, alias = "h", alias = "hum")]
    pub humidity: Option<String>,
    #[serde(default, alias = "ts")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// serialized original payload, stored for audit
    #[serde(skip)]
    pub raw: Option<String>,
}

impl PushRequest {
    /// reads a json body; numbers and numeric strings are both accepted
    pub fn from_json(body: &Value) -> Self {
        let field = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|k| match body.get(*k)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
        };

        Self {
            temperature: field(&["t", "temp", "temperature"]),
            humidity: field(&["h", "hum", "humidity"]),
            timestamp: field(&["ts", "timestamp"]),
            source: field(&["source"]),
            raw: Some(body.to_string()),
        }
    }
}

#[derive(Debug)]
struct Lanes {
    remote: Mutex<()>,
    local: Mutex<()>,
}

#[derive(Debug)]
struct GatewayInner {
    store: SampleStore,
    arbiter: SourceArbiter,
    hub: BroadcastHub,
    timestamp_policy: TimestampPolicy,
    show_sensor_data: bool,
    lanes: Lanes,
}

/// cloneable handle shared by the http handlers and the ingest task
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub freshness: std::time::Duration,
    pub queue_capacity: usize,
    pub timestamp_policy: TimestampPolicy,
    pub show_sensor_data: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            freshness: std::time::Duration::from_secs(60),
            queue_capacity: 64,
            timestamp_policy: TimestampPolicy::ReceiptTime,
            show_sensor_data: false,
        }
    }
}

impl Gateway {
    pub fn new(store: SampleStore, options: GatewayOptions) -> Self {
        let arbiter = SourceArbiter::new(store.clone(), options.freshness);
        Self {
            inner: Arc::new(GatewayInner {
                store,
                arbiter,
                hub: BroadcastHub::new(options.queue_capacity),
                timestamp_policy: options.timestamp_policy,
                show_sensor_data: options.show_sensor_data,
                lanes: Lanes { remote: Mutex::new(()), local: Mutex::new(()) },
            }),
        }
    }

    pub fn store(&self) -> &SampleStore {
        &self.inner.store
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// persist, then arbitrate, then broadcast
    pub async fn accept(&self, m: Measurement) -> Result<StoredRow, StoreError> {
        let lane = match m.source {
            Source::Local => &self.inner.lanes.local,
            _ => &self.inner.lanes.remote,
        };
        let _turn = lane.lock().await;

        let id = match self.inner.store.append(&m).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(source = %m.source, error = %e, "failed to persist sample, dropping it");
                return Err(e);
            }
        };

        if self.inner.show_sensor_data {
            tracing::info!(
                id,
                source = %m.source,
                temperature = m.temperature,
                humidity = m.humidity,
                "sample accepted"
            );
        }

        self.inner.arbiter.record(m.clone());
        self.inner.hub.publish(LiveEvent::Reading(m.clone()));
        Ok(StoredRow { id, measurement: m })
    }

    /// the remote ingestion path: validate, timestamp, accept
    pub async fn push(&self, request: PushRequest) -> Result<StoredRow, IngestError> {
        let received_at = Utc::now();
        let (temperature, humidity) =
            validate::coerce_pair(request.temperature.as_deref(), request.humidity.as_deref())
                .inspect_err(|reason| tracing::debug!(?reason, "push rejected"))?;

        let timestamp = self.resolve_timestamp(request.timestamp.as_deref(), received_at)?;

        // only "local" is honoured; a pusher cannot claim to be the store
        let source = match request.source.as_deref().map(Source::from_tag) {
            Some(Source::Local) => Source::Local,
            _ => Source::Remote,
        };

        let m = Measurement::checked(temperature, humidity, timestamp, source, request.raw)?;
        Ok(self.accept(m).await?)
    }

    fn resolve_timestamp(
        &self,
        supplied: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Rejection> {
        let Some(text) = supplied.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(received_at);
        };

        match parse_timestamp(text) {
            Some(ts) => Ok(ts),
            None => match self.inner.timestamp_policy {
                TimestampPolicy::ReceiptTime => {
                    tracing::debug!(timestamp = %text, "unparsable push timestamp, using receipt time");
                    Ok(received_at)
                }
                TimestampPolicy::Reject => Err(Rejection::InvalidTimestamp),
            },
        }
    }

    pub async fn current(&self) -> Result<Option<Current>, StoreError> {
        self.inner.arbiter.current().await
    }

    pub async fn latest(&self) -> Result<Option<StoredRow>, StoreError> {
        self.inner.store.latest().await
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<StoredRow>, StoreError> {
        self.inner.store.recent(limit).await
    }

    /// attaches a live client, primed with the latest stored sample
    pub async fn subscribe(&self) -> Subscription {
        let snapshot = match self.inner.store.latest().await {
            Ok(row) => row.map(|row| row.measurement),
            Err(e) => {
                tracing::warn!(error = %e, "no initial snapshot for live subscriber");
                None
            }
        };
        self.inner.hub.subscribe(snapshot)
    }

    /// routes one line from the device reader
    pub async fn handle_line(&self, line: ParsedLine) {
        match line {
            ParsedLine::Empty => {}
            ParsedLine::Measurement(m) => {
                // failure is already logged in accept; the reader keeps going
                let _ = self.accept(m).await;
            }
            ParsedLine::Status(status) => {
                match status.level {
                    StatusLevel::Error => tracing::warn!(text = %status.text, "device reported an error"),
                    StatusLevel::Info => tracing::info!(text = %status.text, "device status"),
                }
                self.inner.hub.publish(LiveEvent::Status(status));
            }
            ParsedLine::Unrecognized { line, reason } => {
                tracing::debug!(?reason, line = %line, "discarding device line");
            }
        }
    }
}

/// rfc 3339 first, then a naive "YYYY-MM-DD[T ]HH:MM:SS[.f]" read as utc
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// drains parsed device lines into the gateway until the reader goes away
pub async fn run_local_ingest(gateway: Gateway, mut lines: mpsc::Receiver<ParsedLine>) {
    while let Some(line) = lines.recv().await {
        gateway.handle_line(line).await;
    }
    tracing::info!("local ingest stopped");
}
