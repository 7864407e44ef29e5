//! Sequential allocation shared by split and merge proposals.
//!
//! Items are visited one at a time. Item `i` joins the first cluster with
//! probability `n1 * w1[i] / (n1 * w1[i] + n2 * w2[i])`, where `n1`/`n2` are the
//! running occupancies (both starting at one for the pivot items). Splits
//! sample this recurrence; merges replay it over a known labelling to obtain
//! the probability of the reverse split.

use dpm_core::errors::ErrorInfo;
use dpm_core::{DpmError, RngHandle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::stabilizer::LikelihoodWeights;

/// Side of a two-way allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    /// The cluster weighted by [`LikelihoodWeights::first`].
    First,
    /// The cluster weighted by [`LikelihoodWeights::second`].
    Second,
}

/// One visited item of the recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationStep {
    /// Visit position.
    pub position: usize,
    /// Index into the weight arrays.
    pub index: usize,
    /// Side the item ended up on.
    pub side: Side,
    /// Probability of joining the first side at this point.
    pub probability_first: f64,
    /// `log(p)` or `log(1 - p)` contributed by this step.
    pub log_term: f64,
}

/// Result of a sampled or replayed allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Steps in visit order.
    pub steps: Vec<AllocationStep>,
    /// Sum of every step's log term.
    pub log_probability: f64,
    /// Final occupancy of the first side, pivot included.
    pub first_count: usize,
    /// Final occupancy of the second side, pivot included.
    pub second_count: usize,
}

impl Allocation {
    /// Weight-array indices that ended on `side`, in visit order.
    pub fn indices_on(&self, side: Side) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|step| step.side == side)
            .map(|step| step.index)
            .collect()
    }
}

/// Jain-Neal style sequential allocation sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialAllocationSampler;

impl SequentialAllocationSampler {
    /// Creates the sampler.
    pub fn new() -> Self {
        Self
    }

    /// Samples an allocation, visiting the weights in index order.
    ///
    /// Callers shuffle the items before evaluating their likelihoods, so the
    /// index order already is a random permutation. `inspect` sees every step
    /// before it is accumulated and may abort the allocation.
    pub fn sample<F>(
        &self,
        weights: &LikelihoodWeights,
        rng: &mut RngHandle,
        inspect: F,
    ) -> Result<Allocation, DpmError>
    where
        F: FnMut(&AllocationStep) -> Result<(), DpmError>,
    {
        let decide = |p: f64| {
            if rng.gen::<f64>() < p {
                Side::First
            } else {
                Side::Second
            }
        };
        self.run(
            (0..weights.len()).map(|index| (index, None)),
            weights,
            decide,
            inspect,
        )
    }

    /// Replays a known labelling over the visit `order`.
    ///
    /// `labels[i]` is the side weight index `i` belonged to; `inspect` behaves
    /// as in [`SequentialAllocationSampler::sample`].
    pub fn replay<F>(
        &self,
        weights: &LikelihoodWeights,
        order: &[usize],
        labels: &[Side],
        inspect: F,
    ) -> Result<Allocation, DpmError>
    where
        F: FnMut(&AllocationStep) -> Result<(), DpmError>,
    {
        if order.len() != weights.len() || labels.len() != weights.len() {
            return Err(DpmError::Consistency(
                ErrorInfo::new("replay-length-mismatch", "replay inputs are misaligned")
                    .with_context("weights", weights.len())
                    .with_context("order", order.len())
                    .with_context("labels", labels.len()),
            ));
        }
        let mut visits = Vec::with_capacity(order.len());
        for &index in order {
            let side = labels.get(index).copied().ok_or_else(|| {
                DpmError::Consistency(
                    ErrorInfo::new("replay-order-out-of-range", "visit order exceeds labels")
                        .with_context("index", index),
                )
            })?;
            visits.push((index, Some(side)));
        }
        self.run(visits.into_iter(), weights, |_| Side::First, inspect)
    }

    fn run<I, D, F>(
        &self,
        visits: I,
        weights: &LikelihoodWeights,
        mut decide: D,
        mut inspect: F,
    ) -> Result<Allocation, DpmError>
    where
        I: Iterator<Item = (usize, Option<Side>)>,
        D: FnMut(f64) -> Side,
        F: FnMut(&AllocationStep) -> Result<(), DpmError>,
    {
        let mut first_count = 1usize;
        let mut second_count = 1usize;
        let mut log_probability = 0.0;
        let mut steps = Vec::with_capacity(weights.len());
        for (position, (index, known)) in visits.enumerate() {
            let psi_first = first_count as f64 * weights.first[index];
            let psi_second = second_count as f64 * weights.second[index];
            let p = psi_first / (psi_first + psi_second);
            if !(0.0..=1.0).contains(&p) {
                return Err(DpmError::Numeric(
                    ErrorInfo::new("degenerate-allocation", "allocation probability is undefined")
                        .with_context("position", position)
                        .with_context("index", index)
                        .with_context("psi_first", psi_first)
                        .with_context("psi_second", psi_second),
                ));
            }
            let side = known.unwrap_or_else(|| decide(p));
            let log_term = match side {
                Side::First => p.ln(),
                Side::Second => (-p).ln_1p(),
            };
            let step = AllocationStep {
                position,
                index,
                side,
                probability_first: p,
                log_term,
            };
            inspect(&step)?;
            trace!(position, index, p, ?side, "allocation step");
            match side {
                Side::First => first_count += 1,
                Side::Second => second_count += 1,
            }
            log_probability += log_term;
            steps.push(step);
        }
        Ok(Allocation {
            steps,
            log_probability,
            first_count,
            second_count,
        })
    }
}
