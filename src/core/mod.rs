//! Signal conditioning for the BPM broker.
//!
//! This module contains:
//! - Reading types decoded from devices and broadcast to subscribers
//! - Per-source exponential smoothing with a startup grace window
//! - Finger-contact debouncing and session boundary detection

pub mod reading;
pub mod session;
pub mod smoother;

// Re-export commonly used types
pub use reading::{
    epoch_seconds, Bpm, ConditionedReading, RawReading, SourceId, NO_SIGNAL, RESERVED_FIELDS,
};
pub use session::{FingerDecision, FingerSessionTracker, FingerState, Observation};
pub use smoother::{SignalSmoother, SignalStats};
