//! Exponential smoothing of heart-rate samples.
//!
//! Each source owns one [`SignalSmoother`]. The first samples after start or
//! after a session reset pass through untouched so the filter re-anchors on
//! the new signal instead of dragging a stale average along.

use crate::config::SmoothingConfig;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Summary statistics over a smoother's retained history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub mean: f64,
    /// Population standard deviation
    #[serde(rename = "std")]
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Most recently appended value
    pub last: f64,
}

/// Stateful EMA filter with a startup grace window.
#[derive(Debug, Clone)]
pub struct SignalSmoother {
    alpha: f64,
    min_bpm: f64,
    max_bpm: f64,
    startup_threshold: u32,
    history_length: usize,
    last_smoothed: Option<f64>,
    history: VecDeque<f64>,
    /// Accepted samples since construction or the last reset
    since_reset: u32,
}

impl SignalSmoother {
    pub fn new(config: &SmoothingConfig) -> Self {
        Self {
            alpha: config.alpha,
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
            startup_threshold: config.startup_threshold,
            history_length: config.history_length,
            last_smoothed: None,
            history: VecDeque::with_capacity(config.history_length),
            since_reset: 0,
        }
    }

    /// Add a raw sample and return the conditioned value.
    ///
    /// Out-of-range samples leave the state untouched and echo the last
    /// smoothed value, or the sample itself when there is none yet.
    pub fn add_sample(&mut self, raw: f64) -> f64 {
        if !(self.min_bpm..=self.max_bpm).contains(&raw) {
            tracing::warn!(
                bpm = raw,
                min = self.min_bpm,
                max = self.max_bpm,
                "BPM value outside valid range"
            );
            return self.last_smoothed.unwrap_or(raw);
        }

        if self.since_reset < self.startup_threshold {
            self.since_reset += 1;
            tracing::debug!(
                reading = self.since_reset,
                threshold = self.startup_threshold,
                bpm = raw,
                "Startup reading (no smoothing)"
            );
            self.accept(raw);
            return raw;
        }

        let smoothed = match self.last_smoothed {
            Some(last) => self.alpha * raw + (1.0 - self.alpha) * last,
            None => raw,
        };
        self.accept(smoothed);
        smoothed
    }

    fn accept(&mut self, value: f64) {
        self.last_smoothed = Some(value);
        if self.history.len() == self.history_length {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    /// Start a new session: the next samples fall inside the grace window again.
    ///
    /// History is kept.
    pub fn reset(&mut self) {
        self.since_reset = 0;
        self.last_smoothed = None;
        tracing::debug!("Signal smoother reset for new finger session");
    }

    /// Summary statistics over the retained history, `None` when empty.
    pub fn statistics(&self) -> Option<SignalStats> {
        let last = *self.history.back()?;
        Some(SignalStats {
            mean: self.history.iter().mean(),
            std_dev: self.history.iter().population_std_dev(),
            min: Statistics::min(self.history.iter()),
            max: Statistics::max(self.history.iter()),
            last,
        })
    }

    /// Retained smoothed values, oldest first.
    pub fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    pub fn last_smoothed(&self) -> Option<f64> {
        self.last_smoothed
    }

    /// Whether the next accepted sample will bypass smoothing.
    pub fn in_grace_window(&self) -> bool {
        self.since_reset < self.startup_threshold
    }
}
