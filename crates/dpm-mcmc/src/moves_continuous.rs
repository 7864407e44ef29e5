use std::f64::consts::PI;
use std::fmt::Debug;

use dpm_core::errors::ErrorInfo;
use dpm_core::{DpmError, RngHandle};
use rand::distributions::Distribution;
use rand_distr::{Normal, Uniform};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::partition::Bounds;

/// Increment distribution consumed by the continuous random-walk kernels.
pub trait ProposalDistribution: Debug + Send + Sync {
    /// Draws `dimension` independent increments.
    fn sample(&self, dimension: usize, rng: &mut RngHandle) -> Vec<f64>;

    /// Joint log density of the increments.
    fn log_density(&self, values: &[f64]) -> f64;
}

/// Centred Gaussian increments with a shared standard deviation.
#[derive(Debug, Clone)]
pub struct GaussianProposal {
    sigma: f64,
    normal: Normal<f64>,
}

impl GaussianProposal {
    /// Creates the distribution, rejecting non-positive or non-finite scales.
    pub fn new(sigma: f64) -> Result<Self, DpmError> {
        let normal = Normal::new(0.0, sigma)
            .ok()
            .filter(|_| sigma.is_finite() && sigma > 0.0)
            .ok_or_else(|| invalid_scale("gaussian", sigma))?;
        Ok(Self { sigma, normal })
    }

    /// Standard deviation of each increment.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl ProposalDistribution for GaussianProposal {
    fn sample(&self, dimension: usize, rng: &mut RngHandle) -> Vec<f64> {
        (0..dimension).map(|_| self.normal.sample(rng)).collect()
    }

    fn log_density(&self, values: &[f64]) -> f64 {
        let norm = -0.5 * (2.0 * PI * self.sigma * self.sigma).ln();
        values
            .iter()
            .map(|x| norm - x * x / (2.0 * self.sigma * self.sigma))
            .sum()
    }
}

/// Uniform increments on `[-half_width, half_width]`.
#[derive(Debug, Clone)]
pub struct UniformProposal {
    half_width: f64,
    uniform: Uniform<f64>,
}

impl UniformProposal {
    /// Creates the distribution, rejecting non-positive or non-finite widths.
    pub fn new(half_width: f64) -> Result<Self, DpmError> {
        if !(half_width.is_finite() && half_width > 0.0) {
            return Err(invalid_scale("uniform", half_width));
        }
        Ok(Self {
            half_width,
            uniform: Uniform::new_inclusive(-half_width, half_width),
        })
    }
}

impl ProposalDistribution for UniformProposal {
    fn sample(&self, dimension: usize, rng: &mut RngHandle) -> Vec<f64> {
        (0..dimension).map(|_| self.uniform.sample(rng)).collect()
    }

    fn log_density(&self, values: &[f64]) -> f64 {
        if values.iter().any(|x| x.abs() > self.half_width) {
            return f64::NEG_INFINITY;
        }
        -(values.len() as f64) * (2.0 * self.half_width).ln()
    }
}

fn invalid_scale(family: &str, scale: f64) -> DpmError {
    DpmError::Kernel(
        ErrorInfo::new("invalid-proposal-scale", "proposal scale must be positive and finite")
            .with_context("family", family)
            .with_context("scale", scale),
    )
}

/// Space in which the random walk moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalkSpace {
    /// `new = old * exp(eps)`, with a `-log(new)` Jacobian term.
    Log,
    /// `new = old + eps`, no Jacobian term.
    Linear,
}

/// Candidate value drawn by a continuous kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousDraw {
    /// Proposed value after clamping to the parameter bounds.
    pub value: Vec<f64>,
    /// Log density of the effective increment, Jacobian included.
    pub log_density: f64,
    /// Whether any component hit a bound.
    pub clamped: bool,
}

/// Random-walk kernel proposing continuous cluster parameters.
#[derive(Debug)]
pub struct ContinuousRandomWalkKernel {
    space: WalkSpace,
    distribution: Box<dyn ProposalDistribution>,
}

impl ContinuousRandomWalkKernel {
    /// Multiplicative walk in log space (rates, shapes).
    pub fn log_space(distribution: impl ProposalDistribution + 'static) -> Self {
        Self {
            space: WalkSpace::Log,
            distribution: Box::new(distribution),
        }
    }

    /// Additive walk (invariant proportions).
    pub fn linear(distribution: impl ProposalDistribution + 'static) -> Self {
        Self {
            space: WalkSpace::Linear,
            distribution: Box::new(distribution),
        }
    }

    /// Space of the walk.
    pub fn space(&self) -> WalkSpace {
        self.space
    }

    /// Proposes a new value seeded from `old`.
    ///
    /// Out-of-bounds proposals are clamped rather than rejected; the density
    /// is evaluated at the increment that produces the clamped value, which is
    /// the increment the reverse move reconstructs.
    pub fn propose(
        &self,
        old: &[f64],
        bounds: &Bounds,
        rng: &mut RngHandle,
    ) -> Result<ContinuousDraw, DpmError> {
        if self.space == WalkSpace::Log {
            ensure_positive("old", old)?;
        }
        let increments = self.distribution.sample(old.len(), rng);
        let mut clamped = false;
        let value: Vec<f64> = old
            .iter()
            .zip(increments.iter())
            .map(|(x, eps)| {
                let raw = match self.space {
                    WalkSpace::Log => x * eps.exp(),
                    WalkSpace::Linear => x + eps,
                };
                let bounded = bounds.clamp(raw);
                clamped |= bounded != raw;
                bounded
            })
            .collect();
        let log_density = if clamped {
            debug!(space = ?self.space, ?value, "random-walk proposal clamped to bounds");
            self.reverse_log_density(&value, old)?
        } else {
            self.density_of(&increments, &value)
        };
        Ok(ContinuousDraw {
            value,
            log_density,
            clamped,
        })
    }

    /// Log density of proposing `removed` from `survivor`.
    ///
    /// This is the forward density a split would have produced when creating
    /// `removed` from `survivor`, evaluated when that split is undone.
    pub fn reverse_log_density(&self, removed: &[f64], survivor: &[f64]) -> Result<f64, DpmError> {
        if removed.len() != survivor.len() {
            return Err(DpmError::Kernel(
                ErrorInfo::new("dimension-mismatch", "reverse proposal dimensions differ")
                    .with_context("removed", removed.len())
                    .with_context("survivor", survivor.len()),
            ));
        }
        let increments: Vec<f64> = match self.space {
            WalkSpace::Log => {
                ensure_positive("removed", removed)?;
                ensure_positive("survivor", survivor)?;
                removed
                    .iter()
                    .zip(survivor.iter())
                    .map(|(r, s)| r.ln() - s.ln())
                    .collect()
            }
            WalkSpace::Linear => removed
                .iter()
                .zip(survivor.iter())
                .map(|(r, s)| r - s)
                .collect(),
        };
        Ok(self.density_of(&increments, removed))
    }

    fn density_of(&self, increments: &[f64], value: &[f64]) -> f64 {
        let log_density = self.distribution.log_density(increments);
        match self.space {
            WalkSpace::Log => log_density - value.iter().map(|v| v.ln()).sum::<f64>(),
            WalkSpace::Linear => log_density,
        }
    }
}

fn ensure_positive(role: &str, values: &[f64]) -> Result<(), DpmError> {
    match values.iter().position(|v| !(*v > 0.0)) {
        Some(index) => Err(DpmError::Kernel(
            ErrorInfo::new("non-positive-log-walk", "log-space walk requires positive values")
                .with_context("role", role)
                .with_context("component", index)
                .with_context("value", values[index]),
        )),
        None => Ok(()),
    }
}
