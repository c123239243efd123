//! BPM Broker - real-time heart-rate fan-out for ESP32 pulse sensors.
//!
//! Devices push heart-rate readings over UDP. The broker conditions each
//! source independently (finger-contact tracking plus exponential smoothing)
//! and pushes every conditioned reading to all connected WebSocket
//! subscribers. Subscribers can also query current state with small JSON
//! commands.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          BPM Broker                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │   Ingest    │──▶│   Source    │──▶│ Broadcaster │──▶ WS  │
//! │  │   (UDP)     │   │  Registry   │   │  (fan-out)  │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │                           ▲                                   │
//! │                           │                                   │
//! │                    ┌─────────────┐                            │
//! │                    │  Command    │◀── WS commands             │
//! │                    │  Server     │                            │
//! │                    └─────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bpm_broker::{server, Config};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = server::run(Config::default()).await?;
//! println!("ingest on {}", broker.ingest_addr);
//! tokio::signal::ctrl_c().await?;
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod core;
pub mod counters;
pub mod ingest;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-export key types at crate root for convenience
pub use broadcast::{BroadcastOutcome, Broadcaster, OutboundMessage, SubscriberId};
pub use config::{Config, ConfigError, ListenerConfig, SmoothingConfig};
pub use core::{
    Bpm, ConditionedReading, FingerSessionTracker, FingerState, RawReading, SignalSmoother,
    SignalStats, SourceId,
};
pub use counters::{BrokerCounters, CounterSnapshot, SharedCounters};
pub use ingest::{IngestError, IngestPipeline};
pub use protocol::{Command, CommandError, Outbound, Reply};
pub use registry::SourceRegistry;
pub use server::{BrokerHandle, BrokerState, ServerError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
