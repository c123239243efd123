//! Finger-contact debouncing and session boundary detection.
//!
//! Sensors report `finger_detected = false` in short blips while the finger is
//! still resting on the sensor. A few of those are tolerated; a sustained run
//! switches the output to the no-signal sentinel. When contact returns after
//! any absence, a new session starts and the smoother must re-anchor.

use serde::{Deserialize, Serialize};

/// Contact state derived from the run of finger-absent observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerState {
    /// Last observation had contact
    FingerOk,
    /// Contact lost, still inside the tolerance window
    TransientLoss,
    /// Contact lost for longer than the tolerance window
    FingerLost,
}

/// How the ingest path must treat a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerDecision {
    /// Feed the value through smoothing, reporting the given finger flag
    Process { finger_detected: bool },
    /// No usable heart rate in the reading itself (value <= 0)
    NoHeartRate { finger_detected: bool },
    /// Sustained contact loss; the smoother must not be fed
    NoSignal,
}

/// Result of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub decision: FingerDecision,
    /// Contact returned after an absence; the caller resets its smoother
    pub session_reset: bool,
}

/// Per-source finger session state machine.
#[derive(Debug, Clone)]
pub struct FingerSessionTracker {
    no_finger_threshold: u32,
    consecutive_no_finger: u32,
    finger_present_previously: bool,
}

impl FingerSessionTracker {
    pub fn new(no_finger_threshold: u32) -> Self {
        Self {
            no_finger_threshold,
            consecutive_no_finger: 0,
            finger_present_previously: true,
        }
    }

    /// Record one reading's contact flag and decide how to report it.
    pub fn observe(&mut self, finger_present: bool, raw: f64) -> Observation {
        if finger_present {
            self.consecutive_no_finger = 0;
            let session_reset = !self.finger_present_previously;
            self.finger_present_previously = true;

            let decision = if raw <= 0.0 {
                FingerDecision::NoHeartRate {
                    finger_detected: true,
                }
            } else {
                FingerDecision::Process {
                    finger_detected: true,
                }
            };
            return Observation {
                decision,
                session_reset,
            };
        }

        self.consecutive_no_finger = self.consecutive_no_finger.saturating_add(1);
        self.finger_present_previously = false;

        let decision = if self.consecutive_no_finger > self.no_finger_threshold {
            FingerDecision::NoSignal
        } else if raw <= 0.0 {
            FingerDecision::NoHeartRate {
                finger_detected: false,
            }
        } else {
            // A short blip may still carry a trailing valid reading
            FingerDecision::Process {
                finger_detected: false,
            }
        };

        Observation {
            decision,
            session_reset: false,
        }
    }

    pub fn state(&self) -> FingerState {
        match self.consecutive_no_finger {
            0 => FingerState::FingerOk,
            n if n <= self.no_finger_threshold => FingerState::TransientLoss,
            _ => FingerState::FingerLost,
        }
    }

    pub fn consecutive_no_finger(&self) -> u32 {
        self.consecutive_no_finger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_present_processes() {
        let mut tracker = FingerSessionTracker::new(2);
        let obs = tracker.observe(true, 72.0);
        assert_eq!(
            obs.decision,
            FingerDecision::Process {
                finger_detected: true
            }
        );
        assert!(!obs.session_reset);
        assert_eq!(tracker.state(), FingerState::FingerOk);
    }

    #[test]
    fn test_zero_bpm_with_contact_is_no_heart_rate() {
        let mut tracker = FingerSessionTracker::new(2);
        let obs = tracker.observe(true, 0.0);
        assert_eq!(
            obs.decision,
            FingerDecision::NoHeartRate {
                finger_detected: true
            }
        );
    }

    #[test]
    fn test_sentinel_after_threshold_plus_one() {
        let mut tracker = FingerSessionTracker::new(2);

        for expected_count in 1..=2 {
            let obs = tracker.observe(false, 80.0);
            assert_eq!(
                obs.decision,
                FingerDecision::Process {
                    finger_detected: false
                }
            );
            assert_eq!(tracker.consecutive_no_finger(), expected_count);
            assert_eq!(tracker.state(), FingerState::TransientLoss);
        }

        let obs = tracker.observe(false, 80.0);
        assert_eq!(obs.decision, FingerDecision::NoSignal);
        assert_eq!(tracker.state(), FingerState::FingerLost);

        // Stays lost while contact is absent
        assert_eq!(tracker.observe(false, 80.0).decision, FingerDecision::NoSignal);
    }

    #[test]
    fn test_transient_loss_without_value() {
        let mut tracker = FingerSessionTracker::new(2);
        let obs = tracker.observe(false, -1.0);
        assert_eq!(
            obs.decision,
            FingerDecision::NoHeartRate {
                finger_detected: false
            }
        );
    }

    #[test]
    fn test_return_of_contact_resets_once() {
        let mut tracker = FingerSessionTracker::new(2);
        tracker.observe(true, 70.0);
        for _ in 0..5 {
            tracker.observe(false, 0.0);
        }

        let obs = tracker.observe(true, 75.0);
        assert!(obs.session_reset);
        assert_eq!(tracker.consecutive_no_finger(), 0);
        assert_eq!(tracker.state(), FingerState::FingerOk);

        assert!(!tracker.observe(true, 76.0).session_reset);
    }

    #[test]
    fn test_reset_even_when_returning_reading_has_no_value() {
        let mut tracker = FingerSessionTracker::new(2);
        tracker.observe(false, 80.0);
        let obs = tracker.observe(true, 0.0);
        assert!(obs.session_reset);
        assert_eq!(
            obs.decision,
            FingerDecision::NoHeartRate {
                finger_detected: true
            }
        );
    }

    #[test]
    fn test_long_finger_absence_stays_lost() {
        let mut tracker = FingerSessionTracker::new(2);
        tracker.consecutive_no_finger = u32::MAX - 1;

        for _ in 0..3 {
            let obs = tracker.observe(false, 80.0);
            assert_eq!(obs.decision, FingerDecision::NoSignal);
        }
        assert_eq!(tracker.consecutive_no_finger(), u32::MAX);
        assert_eq!(tracker.state(), FingerState::FingerLost);
    }
}
