//! Datagram ingest: decode, condition, record, broadcast.
//!
//! # Wire format
//!
//! Devices send one UTF-8 JSON object per datagram:
//!
//! ```text
//! {"user": 1, "bpm": 72.0, "finger_detected": true, "device_id": "ESP32_01"}
//! ```
//!
//! `user` and `bpm` are required. `finger_detected` defaults to true for
//! devices that never report contact. Other fields are passed through to
//! subscribers unchanged. Nothing is ever sent back on this channel.

use crate::broadcast::Broadcaster;
use crate::core::{
    ConditionedReading, FingerDecision, RawReading, SourceId, RESERVED_FIELDS,
};
use crate::counters::SharedCounters;
use crate::registry::{SourceEntry, SourceRegistry};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Errors that cause a datagram to be dropped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("datagram is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed datagram: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Datagram payload as sent by devices.
#[derive(Debug, Deserialize)]
struct RawDatagram {
    user: SourceId,
    bpm: f64,
    #[serde(default = "default_finger_detected")]
    finger_detected: bool,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn default_finger_detected() -> bool {
    true
}

/// Decode a datagram into a reading stamped with its sender and arrival time.
pub fn decode_datagram(
    bytes: &[u8],
    sender: SocketAddr,
    received_at: DateTime<Utc>,
) -> Result<RawReading, IngestError> {
    let text = std::str::from_utf8(bytes)?;
    let datagram: RawDatagram = serde_json::from_str(text)?;

    let mut extra = datagram.extra;
    extra.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));

    Ok(RawReading {
        source: datagram.user,
        value: datagram.bpm,
        finger_present: datagram.finger_detected,
        sender,
        received_at,
        extra,
    })
}

/// Conditions readings and forwards them to subscribers.
pub struct IngestPipeline {
    registry: Arc<SourceRegistry>,
    broadcaster: Arc<Broadcaster>,
    counters: SharedCounters,
    smoothing_enabled: bool,
}

impl IngestPipeline {
    pub fn new(
        registry: Arc<SourceRegistry>,
        broadcaster: Arc<Broadcaster>,
        counters: SharedCounters,
    ) -> Self {
        let smoothing_enabled = registry.config().smoothing.enabled;
        Self {
            registry,
            broadcaster,
            counters,
            smoothing_enabled,
        }
    }

    /// Handle one datagram received now.
    pub fn handle(&self, bytes: &[u8], sender: SocketAddr) -> Result<ConditionedReading, IngestError> {
        self.handle_at(bytes, sender, Utc::now())
    }

    /// Handle one datagram with an explicit arrival time.
    pub fn handle_at(
        &self,
        bytes: &[u8],
        sender: SocketAddr,
        received_at: DateTime<Utc>,
    ) -> Result<ConditionedReading, IngestError> {
        self.counters.record_datagram();
        let raw = decode_datagram(bytes, sender, received_at).map_err(|e| {
            self.counters.record_rejected();
            e
        })?;
        Ok(self.process(raw))
    }

    /// Condition a decoded reading, record it and broadcast it.
    pub fn process(&self, raw: RawReading) -> ConditionedReading {
        let entry = self.registry.get_or_create(raw.source);
        let mut entry = entry.lock();

        let reading = condition(&mut entry, &raw, self.smoothing_enabled);
        entry.record_latest(reading.clone());

        // Still under the source lock: subscribers see this source in ingest order
        let outcome = self.broadcaster.broadcast(&reading);
        tracing::trace!(
            source = %raw.source,
            delivered = outcome.delivered,
            "Reading broadcast"
        );
        reading
    }
}

/// Run one reading through the finger tracker and smoother of its source.
pub fn condition(entry: &mut SourceEntry, raw: &RawReading, smoothing_enabled: bool) -> ConditionedReading {
    let observation = entry.session.observe(raw.finger_present, raw.value);

    if observation.session_reset && smoothing_enabled {
        entry.smoother.reset();
        tracing::info!(source = %raw.source, "Finger detected after absence, smoother reset");
    }

    match observation.decision {
        FingerDecision::NoSignal => {
            tracing::info!(
                source = %raw.source,
                ip = %raw.sender.ip(),
                state = ?entry.session.state(),
                count = entry.session.consecutive_no_finger(),
                "No finger detected, reporting no signal"
            );
            ConditionedReading::sentinel(raw, false)
        }
        FingerDecision::NoHeartRate { finger_detected } => {
            tracing::info!(
                source = %raw.source,
                ip = %raw.sender.ip(),
                finger_detected,
                "No heart rate in reading"
            );
            ConditionedReading::sentinel(raw, finger_detected)
        }
        FingerDecision::Process { finger_detected } => {
            if !finger_detected {
                tracing::info!(
                    source = %raw.source,
                    state = ?entry.session.state(),
                    count = entry.session.consecutive_no_finger(),
                    "No finger detected, processing trailing reading"
                );
            }
            if smoothing_enabled {
                let grace = entry.smoother.in_grace_window();
                let smoothed = entry.smoother.add_sample(raw.value);
                tracing::debug!(
                    source = %raw.source,
                    ip = %raw.sender.ip(),
                    raw = raw.value,
                    smoothed,
                    grace,
                    "Reading smoothed"
                );
                ConditionedReading::smoothed(raw, smoothed, finger_detected, entry.smoother.statistics())
            } else {
                tracing::debug!(source = %raw.source, bpm = raw.value, "Reading passed through");
                ConditionedReading::measured(raw, raw.value, finger_detected)
            }
        }
    }
}

/// Receive datagrams until shutdown is signalled.
pub async fn run_udp_listener(
    socket: UdpSocket,
    pipeline: Arc<IngestPipeline>,
    max_datagram_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("UDP listener shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, sender)) => {
                        if let Err(e) = pipeline.handle(&buf[..len], sender) {
                            tracing::warn!(
                                sender = %sender,
                                error = %e,
                                payload = %String::from_utf8_lossy(&buf[..len]),
                                "Dropping datagram"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP recv error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
