//! Pure energy computation over a measurement tuple.
//!
//! The energy function is the hot path of the pipeline: it runs once per
//! token at frame cadence, so it is deterministic, side-effect-free, and
//! allocation-free. The result is always clamped to `[0, 1]` regardless of
//! the configured weights.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the energy function.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnergyError {
    /// A measurement field was NaN. The offending measurement is rejected;
    /// the stream continues.
    #[error("invalid measurement: {field} is NaN")]
    InvalidMeasurement {
        /// Name of the NaN field.
        field: &'static str,
    },
}

/// Weights for the three measurement components.
///
/// The weights are not required to sum to 1; the computed energy is clamped
/// to `[0, 1]` after weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyWeights {
    /// Weight of token cadence.
    #[serde(default = "default_w1")]
    pub w1: f64,

    /// Weight of model certainty.
    #[serde(default = "default_w2")]
    pub w2: f64,

    /// Weight of stall recovery (`1 - stall_fraction`).
    #[serde(default = "default_w3")]
    pub w3: f64,
}

const fn default_w1() -> f64 {
    0.4
}

const fn default_w2() -> f64 {
    0.4
}

const fn default_w3() -> f64 {
    0.2
}

impl Default for EnergyWeights {
    fn default() -> Self {
        Self {
            w1: default_w1(),
            w2: default_w2(),
            w3: default_w3(),
        }
    }
}

/// Per-component detail emitted alongside the energy scalar.
///
/// Carries the clamped inputs and the weighted terms so consumers can render
/// component attribution without recomputing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyDetails {
    /// Clamped cadence input.
    pub cadence: f64,
    /// Clamped certainty input.
    pub certainty: f64,
    /// Clamped stall fraction input.
    pub stall_fraction: f64,
    /// `w1 * cadence`.
    pub cadence_term: f64,
    /// `w2 * certainty`.
    pub certainty_term: f64,
    /// `w3 * (1 - stall_fraction)`.
    pub stall_term: f64,
}

/// One computed energy value plus its detail payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergySample {
    /// Normalized energy, always in `[0, 1]`.
    pub energy: f64,

    /// Component attribution.
    pub details: EnergyDetails,
}

/// The energy function: `clamp(w1*cadence + w2*certainty + w3*(1-stall), 0, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct EnergyFunction {
    weights: EnergyWeights,
}

impl EnergyFunction {
    /// Creates an energy function with the given weights.
    #[must_use]
    pub const fn new(weights: EnergyWeights) -> Self {
        Self { weights }
    }

    /// The configured weights.
    #[must_use]
    pub const fn weights(&self) -> &EnergyWeights {
        &self.weights
    }

    /// Computes energy for one measurement.
    ///
    /// Out-of-range finite inputs are clamped to `[0, 1]` before weighting.
    ///
    /// # Errors
    ///
    /// Returns [`EnergyError::InvalidMeasurement`] if any field is NaN.
    pub fn compute(&self, m: &crate::signal::Measurement) -> Result<EnergySample, EnergyError> {
        if m.cadence.is_nan() {
            return Err(EnergyError::InvalidMeasurement { field: "cadence" });
        }
        if m.certainty.is_nan() {
            return Err(EnergyError::InvalidMeasurement { field: "certainty" });
        }
        if m.stall_fraction.is_nan() {
            return Err(EnergyError::InvalidMeasurement {
                field: "stall_fraction",
            });
        }

        let cadence = m.cadence.clamp(0.0, 1.0);
        let certainty = m.certainty.clamp(0.0, 1.0);
        let stall_fraction = m.stall_fraction.clamp(0.0, 1.0);

        let cadence_term = self.weights.w1 * cadence;
        let certainty_term = self.weights.w2 * certainty;
        let stall_term = self.weights.w3 * (1.0 - stall_fraction);

        let energy = (cadence_term + certainty_term + stall_term).clamp(0.0, 1.0);

        Ok(EnergySample {
            energy,
            details: EnergyDetails {
                cadence,
                certainty,
                stall_fraction,
                cadence_term,
                certainty_term,
                stall_term,
            },
        })
    }
}

impl Default for EnergyFunction {
    fn default() -> Self {
        Self::new(EnergyWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::signal::Measurement;

    #[test]
    fn test_full_signal_yields_one() {
        let f = EnergyFunction::default();
        let sample = f.compute(&Measurement::new(1.0, 1.0, 0.0)).unwrap();
        assert!((sample.energy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dead_signal_yields_zero() {
        let f = EnergyFunction::default();
        let sample = f.compute(&Measurement::new(0.0, 0.0, 1.0)).unwrap();
        assert!(sample.energy.abs() < 1e-12);
    }

    #[test]
    fn test_midpoint_with_default_weights() {
        let f = EnergyFunction::default();
        let sample = f.compute(&Measurement::new(0.5, 0.5, 0.5)).unwrap();
        // 0.4*0.5 + 0.4*0.5 + 0.2*0.5
        assert!((sample.energy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_overweighted_result_clamps() {
        let f = EnergyFunction::new(EnergyWeights {
            w1: 2.0,
            w2: 2.0,
            w3: 2.0,
        });
        let sample = f.compute(&Measurement::new(1.0, 1.0, 0.0)).unwrap();
        assert!((sample.energy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_input_clamps_before_weighting() {
        let f = EnergyFunction::default();
        let sample = f.compute(&Measurement::new(7.0, -3.0, 0.0)).unwrap();
        let expected = f.compute(&Measurement::new(1.0, 0.0, 0.0)).unwrap();
        assert!((sample.energy - expected.energy).abs() < 1e-12);
    }

    #[test]
    fn test_nan_is_rejected_with_field_name() {
        let f = EnergyFunction::default();

        let err = f
            .compute(&Measurement::new(f64::NAN, 0.5, 0.5))
            .unwrap_err();
        assert_eq!(err, EnergyError::InvalidMeasurement { field: "cadence" });

        let err = f
            .compute(&Measurement::new(0.5, 0.5, f64::NAN))
            .unwrap_err();
        assert_eq!(
            err,
            EnergyError::InvalidMeasurement {
                field: "stall_fraction"
            }
        );
    }

    #[test]
    fn test_details_carry_weighted_terms() {
        let f = EnergyFunction::default();
        let sample = f.compute(&Measurement::new(1.0, 0.5, 0.5)).unwrap();

        assert!((sample.details.cadence_term - 0.4).abs() < 1e-12);
        assert!((sample.details.certainty_term - 0.2).abs() < 1e-12);
        assert!((sample.details.stall_term - 0.1).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_energy_is_bounded(
            cadence in -10.0f64..10.0,
            certainty in -10.0f64..10.0,
            stall in -10.0f64..10.0,
        ) {
            let f = EnergyFunction::default();
            let sample = f.compute(&Measurement::new(cadence, certainty, stall)).unwrap();
            prop_assert!(sample.energy >= 0.0);
            prop_assert!(sample.energy <= 1.0);
        }

        #[test]
        fn prop_energy_is_deterministic(
            cadence in 0.0f64..=1.0,
            certainty in 0.0f64..=1.0,
            stall in 0.0f64..=1.0,
        ) {
            let f = EnergyFunction::default();
            let m = Measurement::new(cadence, certainty, stall);
            let a = f.compute(&m).unwrap();
            let b = f.compute(&m).unwrap();
            prop_assert_eq!(a.energy.to_bits(), b.energy.to_bits());
        }
    }
}
