//! Conversion of paired log-likelihoods into finite likelihood ratios.

use dpm_core::errors::ErrorInfo;
use dpm_core::DpmError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Likelihood below which the pair is rescaled against its extremum.
pub const DEFAULT_UNDERFLOW_THRESHOLD: f64 = 1e-100;

/// Which extremum of the pair anchors the rescaling.
///
/// Split moves anchor on the smaller log-likelihood, merge moves on the larger
/// one. Both keep the ratio between the two weights intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StabilizeMode {
    /// Anchor on `min(log_a, log_b)` (split moves).
    Min,
    /// Anchor on `max(log_a, log_b)` (merge moves).
    Max,
}

/// Per-item likelihood weights under two competing hypotheses.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodWeights {
    /// Weights under the first hypothesis.
    pub first: Vec<f64>,
    /// Weights under the second hypothesis.
    pub second: Vec<f64>,
}

impl LikelihoodWeights {
    /// Number of items covered by the weights.
    pub fn len(&self) -> usize {
        self.first.len()
    }

    /// Returns `true` when no items are covered.
    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
    }
}

/// Stabilizes two aligned log-likelihood arrays into finite weights.
///
/// A NaN, a `+inf`, or a pair where both sides are `-inf` is a numeric
/// degeneracy and is reported as [`DpmError::Numeric`].
pub fn stabilize(
    log_first: &[f64],
    log_second: &[f64],
    mode: StabilizeMode,
    threshold: f64,
) -> Result<LikelihoodWeights, DpmError> {
    if log_first.len() != log_second.len() {
        return Err(DpmError::Consistency(
            ErrorInfo::new(
                "stabilizer-length-mismatch",
                "log-likelihood arrays must be aligned",
            )
            .with_context("first", log_first.len())
            .with_context("second", log_second.len()),
        ));
    }
    let mut weights = LikelihoodWeights {
        first: Vec::with_capacity(log_first.len()),
        second: Vec::with_capacity(log_second.len()),
    };
    for (index, (&a, &b)) in log_first.iter().zip(log_second.iter()).enumerate() {
        check_log_likelihood(index, a, b)?;
        let (wa, wb) = stabilize_pair(a, b, mode, threshold);
        weights.first.push(wa);
        weights.second.push(wb);
    }
    Ok(weights)
}

/// Stabilizes a single pair. Inputs must already be free of NaN and `+inf`.
pub fn stabilize_pair(a: f64, b: f64, mode: StabilizeMode, threshold: f64) -> (f64, f64) {
    let base = match mode {
        StabilizeMode::Min => a.min(b),
        StabilizeMode::Max => a.max(b),
    };
    if base.exp() >= threshold {
        return (a.exp(), b.exp());
    }
    let (wa, wb) = if base == a {
        (1.0, (b - base).exp())
    } else {
        ((a - base).exp(), 1.0)
    };
    if wa.is_finite() && wb.is_finite() {
        return (wa, wb);
    }
    // Anchoring on the minimum overflowed the other side; fall back to the maximum.
    let top = a.max(b);
    debug!(log_a = a, log_b = b, "stabilizer fell back to max anchoring");
    ((a - top).exp(), (b - top).exp())
}

fn check_log_likelihood(index: usize, a: f64, b: f64) -> Result<(), DpmError> {
    let degenerate = a.is_nan()
        || b.is_nan()
        || a == f64::INFINITY
        || b == f64::INFINITY
        || (a == f64::NEG_INFINITY && b == f64::NEG_INFINITY);
    if degenerate {
        let code = if a.is_nan() || b.is_nan() {
            "nan-log-likelihood"
        } else {
            "degenerate-log-likelihood"
        };
        return Err(DpmError::Numeric(
            ErrorInfo::new(code, "log-likelihood pair cannot be stabilized")
                .with_context("position", index)
                .with_context("log_first", a)
                .with_context("log_second", b)
                .with_hint("inspect the likelihood oracle for this item"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = DEFAULT_UNDERFLOW_THRESHOLD;

    #[test]
    fn moderate_values_are_plain_exponentials() {
        let (a, b) = stabilize_pair(-2.0, -3.0, StabilizeMode::Min, T);
        assert_eq!(a, (-2.0f64).exp());
        assert_eq!(b, (-3.0f64).exp());
    }

    #[test]
    fn max_mode_pins_the_larger_side() {
        let (a, b) = stabilize_pair(-900.0, -905.0, StabilizeMode::Max, T);
        assert_eq!(a, 1.0);
        assert!((b - (-5.0f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn min_mode_pins_the_smaller_side() {
        let (a, b) = stabilize_pair(-900.0, -905.0, StabilizeMode::Min, T);
        assert_eq!(b, 1.0);
        assert!((a - 5.0f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn min_mode_overflow_falls_back_to_max_anchor() {
        let (a, b) = stabilize_pair(-1.0, -2000.0, StabilizeMode::Min, T);
        assert_eq!(a, 1.0);
        assert_eq!(b, 0.0);
    }

    #[test]
    fn single_negative_infinity_keeps_other_side() {
        let (a, b) = stabilize_pair(f64::NEG_INFINITY, -4.0, StabilizeMode::Max, T);
        assert_eq!(a, 0.0);
        assert!(b > 0.0);
        let (a, b) = stabilize_pair(f64::NEG_INFINITY, -400.0, StabilizeMode::Min, T);
        assert_eq!((a, b), (0.0, 1.0));
    }

    #[test]
    fn nan_is_fatal() {
        let err = stabilize(&[-1.0, f64::NAN], &[-1.0, -2.0], StabilizeMode::Min, T).unwrap_err();
        assert_eq!(err.info().code, "nan-log-likelihood");
        assert_eq!(err.info().context["position"], "1");
    }

    #[test]
    fn double_negative_infinity_is_fatal() {
        let err = stabilize(
            &[f64::NEG_INFINITY],
            &[f64::NEG_INFINITY],
            StabilizeMode::Max,
            T,
        )
        .unwrap_err();
        assert_eq!(err.info().code, "degenerate-log-likelihood");
    }

    #[test]
    fn misaligned_inputs_are_a_consistency_error() {
        let err = stabilize(&[-1.0], &[], StabilizeMode::Max, T).unwrap_err();
        assert!(err.is_consistency());
    }
}
