#![allow(dead_code)]

use std::collections::BTreeSet;

use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError, ParameterId};
use dpm_mcmc::{
    ClusterParams, ClusterPartition, LikelihoodOracle, PartitionBounds, ProposerConfig,
    SplitMergeProposer,
};

/// Deterministic per-site log-likelihood of `item` under `params`.
pub fn site_log_likelihood(params: &ClusterParams, item: usize) -> f64 {
    let target = 0.5 + (item % 4) as f64;
    let rate_term = -(params.rate - target).powi(2);
    let shape_term = -0.1 * (params.shape - 1.0).powi(2);
    let invariant_term = (1.0 - params.invariant_proportion).ln_1p();
    let model_term = -0.05 * params.model_choice as f64;
    rate_term + shape_term + invariant_term + model_term
}

/// Value substituted for selected items, used to inject degenerate likelihoods.
#[derive(Debug, Clone, Copy)]
pub struct Override {
    pub item: usize,
    pub value: f64,
}

/// Synthetic oracle enforcing the `restrict_to` contract.
#[derive(Debug, Default)]
pub struct SyntheticOracle {
    scope: Option<Vec<usize>>,
    parameter_lookup: bool,
    overrides: Vec<Override>,
    cache_drift: f64,
    pub evaluations: usize,
}

impl SyntheticOracle {
    /// Oracle exposing only cluster-keyed cached lookup.
    pub fn by_cluster() -> Self {
        Self::default()
    }

    /// Oracle exposing parameter-keyed cached lookup.
    pub fn by_parameter() -> Self {
        Self {
            parameter_lookup: true,
            ..Self::default()
        }
    }

    /// Replaces every evaluated likelihood of `item` with `value`.
    pub fn with_override(mut self, item: usize, value: f64) -> Self {
        self.overrides.push(Override { item, value });
        self
    }

    /// Offsets every cached likelihood, making the cache stale.
    pub fn with_cache_drift(mut self, drift: f64) -> Self {
        self.cache_drift = drift;
        self
    }

    fn value(&self, params: &ClusterParams, item: usize) -> f64 {
        self.overrides
            .iter()
            .find(|o| o.item == item)
            .map(|o| o.value)
            .unwrap_or_else(|| site_log_likelihood(params, item))
    }
}

impl LikelihoodOracle for SyntheticOracle {
    fn restrict_to(&mut self, items: &[usize]) -> Result<(), DpmError> {
        let distinct: BTreeSet<usize> = items.iter().copied().collect();
        if distinct.len() != items.len() {
            return Err(DpmError::Oracle(ErrorInfo::new(
                "duplicate-scope",
                "scope lists an item twice",
            )));
        }
        self.scope = Some(items.to_vec());
        Ok(())
    }

    fn evaluate(&mut self, params: &ClusterParams, items: &[usize]) -> Result<Vec<f64>, DpmError> {
        let scope = self.scope.take().ok_or_else(|| {
            DpmError::Oracle(ErrorInfo::new("unscoped-evaluation", "restrict_to was not called"))
        })?;
        if scope != items {
            return Err(DpmError::Oracle(ErrorInfo::new(
                "scope-mismatch",
                "evaluation differs from the restricted scope",
            )));
        }
        self.evaluations += 1;
        Ok(items.iter().map(|item| self.value(params, *item)).collect())
    }

    fn cached_by_cluster(
        &self,
        partition: &ClusterPartition,
        cluster: ClusterId,
        item: usize,
    ) -> Result<f64, DpmError> {
        Ok(self.value(&partition.params(cluster)?, item) + self.cache_drift)
    }

    fn supports_parameter_lookup(&self) -> bool {
        self.parameter_lookup
    }

    fn cached_by_parameter(
        &self,
        partition: &ClusterPartition,
        parameter: ParameterId,
        item: usize,
    ) -> Result<f64, DpmError> {
        let cluster = partition.rates().position_of(parameter).ok_or_else(|| {
            DpmError::Oracle(
                ErrorInfo::new("unknown-parameter", "no cluster owns this parameter")
                    .with_context("parameter", parameter),
            )
        })?;
        Ok(self.value(&partition.params(cluster)?, item) + self.cache_drift)
    }
}

pub fn params(rate: f64, model_choice: i64) -> ClusterParams {
    ClusterParams {
        rate,
        shape: 1.0,
        invariant_proportion: 0.2,
        model_choice,
    }
}

/// Partition over `pointers` with one parameter vector per cluster.
pub fn partition(pointers: &[usize], clusters: &[ClusterParams]) -> ClusterPartition {
    ClusterPartition::new(pointers, clusters, PartitionBounds::default()).unwrap()
}

pub fn proposer(oracle: SyntheticOracle) -> SplitMergeProposer<SyntheticOracle> {
    SplitMergeProposer::from_config(oracle, &ProposerConfig::default()).unwrap()
}
