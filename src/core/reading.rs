//! Reading types flowing through the broker.
//!
//! A [`RawReading`] is decoded from a device datagram and consumed by the
//! ingest pipeline; a [`ConditionedReading`] is what subscribers receive.

use crate::core::smoother::SignalStats;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;

/// Wire marker reported in place of a numeric BPM.
pub const NO_SIGNAL: &str = "--";

/// Output keys assigned by the broker; datagram fields with these names are not passed through.
pub const RESERVED_FIELDS: &[&str] = &[
    "user",
    "bpm",
    "bpm_raw",
    "bpm_smoothed",
    "no_heart_rate",
    "finger_detected",
    "signal_stats",
    "server_timestamp",
    "source_ip",
    "received_at",
];

/// Seconds since the Unix epoch with microsecond precision.
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

/// Identifier of a telemetry-emitting device or user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for SourceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Reported heart rate: a number, or the no-signal sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bpm {
    Measured(f64),
    NoSignal,
}

impl Bpm {
    pub fn value(&self) -> Option<f64> {
        match self {
            Bpm::Measured(v) => Some(*v),
            Bpm::NoSignal => None,
        }
    }

    pub fn is_no_signal(&self) -> bool {
        matches!(self, Bpm::NoSignal)
    }
}

impl Serialize for Bpm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Bpm::Measured(v) => serializer.serialize_f64(*v),
            Bpm::NoSignal => serializer.serialize_str(NO_SIGNAL),
        }
    }
}

impl<'de> Deserialize<'de> for Bpm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BpmVisitor;

        impl<'de> Visitor<'de> for BpmVisitor {
            type Value = Bpm;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a number or \"{NO_SIGNAL}\"")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Bpm, E> {
                Ok(Bpm::Measured(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bpm, E> {
                Ok(Bpm::Measured(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bpm, E> {
                Ok(Bpm::Measured(v as f64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Bpm, E> {
                if v == NO_SIGNAL {
                    Ok(Bpm::NoSignal)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(BpmVisitor)
    }
}

/// A decoded device reading, stamped on arrival.
#[derive(Debug, Clone)]
pub struct RawReading {
    pub source: SourceId,
    pub value: f64,
    pub finger_present: bool,
    pub sender: SocketAddr,
    pub received_at: DateTime<Utc>,
    /// Datagram fields the broker does not interpret, passed through to subscribers
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Output record for one reading, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionedReading {
    pub user: SourceId,
    pub bpm: Bpm,
    /// Original value, present when smoothing ran or a sentinel replaced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm_raw: Option<f64>,
    pub bpm_smoothed: bool,
    pub no_heart_rate: bool,
    pub finger_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_stats: Option<SignalStats>,
    /// Receive time as epoch seconds
    pub server_timestamp: f64,
    pub source_ip: String,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConditionedReading {
    /// Sentinel reading carrying the raw value for diagnostics.
    pub fn sentinel(raw: &RawReading, finger_detected: bool) -> Self {
        Self::stamped(raw, Bpm::NoSignal, Some(raw.value), false, true, finger_detected, None)
    }

    /// Reading reported without smoothing.
    pub fn measured(raw: &RawReading, bpm: f64, finger_detected: bool) -> Self {
        Self::stamped(raw, Bpm::Measured(bpm), None, false, false, finger_detected, None)
    }

    /// Reading produced by the smoother, carrying the raw value alongside.
    pub fn smoothed(
        raw: &RawReading,
        bpm: f64,
        finger_detected: bool,
        signal_stats: Option<SignalStats>,
    ) -> Self {
        Self::stamped(
            raw,
            Bpm::Measured(bpm),
            Some(raw.value),
            true,
            false,
            finger_detected,
            signal_stats,
        )
    }

    fn stamped(
        raw: &RawReading,
        bpm: Bpm,
        bpm_raw: Option<f64>,
        bpm_smoothed: bool,
        no_heart_rate: bool,
        finger_detected: bool,
        signal_stats: Option<SignalStats>,
    ) -> Self {
        Self {
            user: raw.source,
            bpm,
            bpm_raw,
            bpm_smoothed,
            no_heart_rate,
            finger_detected,
            signal_stats,
            server_timestamp: epoch_seconds(raw.received_at),
            source_ip: raw.sender.ip().to_string(),
            received_at: raw.received_at,
            extra: raw.extra.clone(),
        }
    }
}
