//! Subscriber protocol: commands in, replies out.
//!
//! Every message is a JSON text frame. Commands carry a `type` tag:
//!
//! | command              | fields                  |
//! |----------------------|-------------------------|
//! | `get_status`         |                         |
//! | `get_latest`         | `source_id` (`user_id`) |
//! | `get_signal_history` | `source_id` (`user_id`) |
//! | `get_all_statistics` |                         |
//!
//! Broadcast readings and the `get_latest` reply are bare
//! [`ConditionedReading`] objects; all other replies are tagged.

use crate::broadcast::OutboundMessage;
use crate::config::Config;
use crate::core::{ConditionedReading, SignalStats, SourceId};
use crate::counters::CounterSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Command types understood by the broker.
pub const COMMAND_TYPES: &[&str] = &[
    "get_status",
    "get_latest",
    "get_signal_history",
    "get_all_statistics",
];

/// A decoded subscriber command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    GetStatus,
    GetLatest {
        #[serde(alias = "user_id")]
        source_id: SourceId,
    },
    GetSignalHistory {
        #[serde(alias = "user_id")]
        source_id: SourceId,
    },
    GetAllStatistics,
}

/// Why an inbound message could not be turned into a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Missing command type")]
    MissingType,
    #[error("Unknown command type: {0}")]
    Unknown(String),
    #[error("Invalid {command} command: {source}")]
    InvalidFields {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Command {
    /// Decode one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(CommandError::InvalidJson)?;

        let command = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(CommandError::MissingType)?
            .to_string();

        if !COMMAND_TYPES.contains(&command.as_str()) {
            return Err(CommandError::Unknown(command));
        }

        serde_json::from_value(value)
            .map_err(|source| CommandError::InvalidFields { command, source })
    }
}

/// Smoothing parameters reported in status replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingSummary {
    pub alpha: f64,
    pub history_length: usize,
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub startup_threshold: u32,
    pub no_finger_threshold: u32,
}

impl From<&Config> for SmoothingSummary {
    fn from(config: &Config) -> Self {
        Self {
            alpha: config.smoothing.alpha,
            history_length: config.smoothing.history_length,
            min_bpm: config.smoothing.min_bpm,
            max_bpm: config.smoothing.max_bpm,
            startup_threshold: config.smoothing.startup_threshold,
            no_finger_threshold: config.no_finger_threshold,
        }
    }
}

/// Tagged replies sent to a single subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Sent once after the initial replay
    Status {
        message: String,
        active_devices: Vec<SourceId>,
        timestamp: f64,
    },
    StatusResponse {
        active_devices: Vec<SourceId>,
        connected_clients: usize,
        latest_data: BTreeMap<SourceId, ConditionedReading>,
        smoothing_enabled: bool,
        smoothing_config: SmoothingSummary,
        counters: CounterSnapshot,
        timestamp: f64,
    },
    SignalHistoryResponse {
        user_id: SourceId,
        history: Vec<f64>,
        statistics: Option<SignalStats>,
        timestamp: f64,
    },
    AllStatisticsResponse {
        user_statistics: BTreeMap<SourceId, Option<SignalStats>>,
        timestamp: f64,
    },
    Error {
        error: String,
    },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            error: message.into(),
        }
    }
}

/// Anything written to a subscriber socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Reading(ConditionedReading),
    Reply(Reply),
}

impl Outbound {
    pub fn to_message(&self) -> Result<OutboundMessage, serde_json::Error> {
        Ok(serde_json::to_string(self)?.into())
    }
}

impl From<Reply> for Outbound {
    fn from(reply: Reply) -> Self {
        Outbound::Reply(reply)
    }
}
