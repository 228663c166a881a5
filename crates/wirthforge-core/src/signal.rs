//! Signal extraction from raw token telemetry.
//!
//! The inference engine reports one [`TokenSample`] per generated token. The
//! [`SignalExtractor`] normalizes each sample into a [`Measurement`] tuple of
//! cadence, certainty, and stall fraction, each in `[0, 1]`, ready for the
//! energy function.
//!
//! Extraction never fails: out-of-range finite values clamp, and NaN inputs
//! propagate through to the energy function, which rejects the measurement
//! there. Keeping rejection in one place means a malformed sample costs
//! exactly one dropped measurement, never the stream.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Number of recent inter-token gaps kept for cadence smoothing.
///
/// Token arrival jitters at millisecond scale; a short mean window damps the
/// jitter without hiding genuine cadence changes for more than a few tokens.
const CADENCE_WINDOW: usize = 8;

/// Raw per-token telemetry from the inference engine.
///
/// The inbound stream is assumed to be time-ordered by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenSample {
    /// Milliseconds since the previous token was emitted.
    pub gap_ms: f64,

    /// Model confidence for this token, `[0, 1]`.
    pub confidence: f64,

    /// Milliseconds of the current frame spent stalled (no decode progress).
    pub stall_ms: f64,
}

impl TokenSample {
    /// Creates a new token sample.
    #[must_use]
    pub const fn new(gap_ms: f64, confidence: f64, stall_ms: f64) -> Self {
        Self {
            gap_ms,
            confidence,
            stall_ms,
        }
    }
}

/// A normalized measurement tuple, consumed immediately by the energy
/// function.
///
/// All fields are in `[0, 1]` for well-formed input. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Token generation cadence relative to the nominal rate (1.0 = at or
    /// above nominal).
    pub cadence: f64,

    /// Model certainty for the token.
    pub certainty: f64,

    /// Fraction of the frame spent stalled.
    pub stall_fraction: f64,
}

impl Measurement {
    /// Creates a measurement from already-normalized components.
    #[must_use]
    pub const fn new(cadence: f64, certainty: f64, stall_fraction: f64) -> Self {
        Self {
            cadence,
            certainty,
            stall_fraction,
        }
    }
}

/// Normalizes raw token telemetry into measurement tuples.
///
/// The extractor keeps a small window of recent inter-token gaps so cadence
/// reflects the short-term rate rather than single-token jitter.
#[derive(Debug, Clone)]
pub struct SignalExtractor {
    nominal_gap_ms: f64,
    frame_interval_ms: f64,
    recent_gaps: VecDeque<f64>,
}

impl SignalExtractor {
    /// Creates an extractor.
    ///
    /// `nominal_gap_ms` is the inter-token gap that counts as full cadence;
    /// `frame_interval_ms` scales stall time into a fraction of the frame.
    /// Non-positive arguments fall back to 1.0 ms so the ratios stay finite.
    #[must_use]
    pub fn new(nominal_gap_ms: f64, frame_interval_ms: f64) -> Self {
        Self {
            nominal_gap_ms: if nominal_gap_ms > 0.0 {
                nominal_gap_ms
            } else {
                1.0
            },
            frame_interval_ms: if frame_interval_ms > 0.0 {
                frame_interval_ms
            } else {
                1.0
            },
            recent_gaps: VecDeque::with_capacity(CADENCE_WINDOW),
        }
    }

    /// Extracts a normalized measurement from one token sample.
    ///
    /// NaN fields pass through so the energy function can reject the
    /// measurement with a precise error.
    pub fn extract(&mut self, sample: &TokenSample) -> Measurement {
        let cadence = self.cadence_for(sample.gap_ms);
        let certainty = sample.confidence.clamp(0.0, 1.0);
        let stall_fraction = (sample.stall_ms / self.frame_interval_ms).clamp(0.0, 1.0);

        Measurement {
            cadence,
            certainty,
            stall_fraction,
        }
    }

    /// Clears the cadence smoothing window.
    pub fn reset(&mut self) {
        self.recent_gaps.clear();
    }

    fn cadence_for(&mut self, gap_ms: f64) -> f64 {
        if gap_ms.is_nan() {
            return f64::NAN;
        }

        if self.recent_gaps.len() == CADENCE_WINDOW {
            self.recent_gaps.pop_front();
        }
        // A zero or negative gap is a burst of tokens in the same instant;
        // record it as instantaneous rather than poisoning the mean.
        self.recent_gaps.push_back(gap_ms.max(0.0));

        let sum: f64 = self.recent_gaps.iter().sum();
        let mean = sum / self.recent_gaps.len() as f64;
        if mean <= 0.0 {
            return 1.0;
        }

        (self.nominal_gap_ms / mean).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_nominal_cadence() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        let m = extractor.extract(&TokenSample::new(50.0, 0.9, 0.0));

        assert!((m.cadence - 1.0).abs() < 1e-9);
        assert!((m.certainty - 0.9).abs() < 1e-9);
        assert!((m.stall_fraction - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_slow_cadence() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        let m = extractor.extract(&TokenSample::new(100.0, 0.5, 0.0));

        assert!((m.cadence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_extract_smooths_over_window() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        extractor.extract(&TokenSample::new(25.0, 0.5, 0.0));
        let m = extractor.extract(&TokenSample::new(75.0, 0.5, 0.0));

        // Mean gap is 50ms, so cadence recovers to nominal.
        assert!((m.cadence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_clamps_out_of_range() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        let m = extractor.extract(&TokenSample::new(1.0, 1.7, 100.0));

        assert!((m.cadence - 1.0).abs() < 1e-9);
        assert!((m.certainty - 1.0).abs() < 1e-9);
        assert!((m.stall_fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_propagates_nan() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        let m = extractor.extract(&TokenSample::new(f64::NAN, 0.5, 0.0));

        assert!(m.cadence.is_nan());
    }

    #[test]
    fn test_zero_gap_burst() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        let m = extractor.extract(&TokenSample::new(0.0, 0.5, 0.0));

        assert!((m.cadence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_clears_window() {
        let mut extractor = SignalExtractor::new(50.0, 16.67);
        extractor.extract(&TokenSample::new(200.0, 0.5, 0.0));
        extractor.reset();
        let m = extractor.extract(&TokenSample::new(50.0, 0.5, 0.0));

        assert!((m.cadence - 1.0).abs() < 1e-9);
    }
}
