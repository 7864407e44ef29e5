//! Contract with the external per-site likelihood evaluator.

use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError, ParameterId};

use crate::partition::{ClusterParams, ClusterPartition};

/// Per-site likelihood evaluator consumed by the split-merge proposer.
///
/// Calls are stateful: [`LikelihoodOracle::restrict_to`] scopes the next
/// [`LikelihoodOracle::evaluate`] to exactly the given items, and must be
/// issued again before every new candidate evaluation.
pub trait LikelihoodOracle {
    /// Scopes subsequent evaluation to `items`.
    fn restrict_to(&mut self, items: &[usize]) -> Result<(), DpmError>;

    /// Log-likelihood of each item under `params`, aligned with `items`.
    fn evaluate(&mut self, params: &ClusterParams, items: &[usize]) -> Result<Vec<f64>, DpmError>;

    /// Committed log-likelihood of `item` under its current cluster.
    fn cached_by_cluster(
        &self,
        partition: &ClusterPartition,
        cluster: ClusterId,
        item: usize,
    ) -> Result<f64, DpmError>;

    /// Whether [`LikelihoodOracle::cached_by_parameter`] is available.
    fn supports_parameter_lookup(&self) -> bool {
        false
    }

    /// Committed log-likelihood of `item` keyed by parameter identity.
    fn cached_by_parameter(
        &self,
        _partition: &ClusterPartition,
        parameter: ParameterId,
        item: usize,
    ) -> Result<f64, DpmError> {
        Err(DpmError::Oracle(
            ErrorInfo::new(
                "lookup-unsupported",
                "oracle does not support parameter-keyed lookup",
            )
            .with_context("parameter", parameter)
            .with_context("item", item),
        ))
    }
}

/// Cached-likelihood lookup strategy, resolved once from the oracle's capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedLookup {
    /// Key lookups on the cluster's rate parameter identity.
    ByParameter,
    /// Key lookups on the positional cluster id.
    ByCluster,
}

impl CachedLookup {
    /// Picks the strongest lookup the oracle declares.
    pub fn resolve<O: LikelihoodOracle + ?Sized>(oracle: &O) -> Self {
        if oracle.supports_parameter_lookup() {
            CachedLookup::ByParameter
        } else {
            CachedLookup::ByCluster
        }
    }

    /// Cached log-likelihood of `item` under `cluster`'s committed parameters.
    pub fn site_log_likelihood<O: LikelihoodOracle + ?Sized>(
        &self,
        oracle: &O,
        partition: &ClusterPartition,
        cluster: ClusterId,
        item: usize,
    ) -> Result<f64, DpmError> {
        let value = match self {
            CachedLookup::ByParameter => {
                let parameter = partition.parameter_id(cluster)?;
                oracle.cached_by_parameter(partition, parameter, item)
            }
            CachedLookup::ByCluster => oracle.cached_by_cluster(partition, cluster, item),
        };
        value.map_err(|err| {
            err.with_context("item", item)
                .with_context("cluster", cluster)
                .with_context("lookup", format!("{self:?}"))
        })
    }

    /// Cached log-likelihoods for several items of one cluster.
    pub fn site_log_likelihoods<O: LikelihoodOracle + ?Sized>(
        &self,
        oracle: &O,
        partition: &ClusterPartition,
        cluster: ClusterId,
        items: &[usize],
    ) -> Result<Vec<f64>, DpmError> {
        items
            .iter()
            .map(|&item| self.site_log_likelihood(oracle, partition, cluster, item))
            .collect()
    }
}

/// Scopes the oracle to `items` and evaluates them under `params`.
///
/// The result must be aligned with `items`; a length mismatch is a
/// consistency error.
pub fn evaluate_scoped<O: LikelihoodOracle + ?Sized>(
    oracle: &mut O,
    params: &ClusterParams,
    items: &[usize],
) -> Result<Vec<f64>, DpmError> {
    oracle
        .restrict_to(items)
        .map_err(|err| err.with_context("stage", "restrict"))?;
    let values = oracle
        .evaluate(params, items)
        .map_err(|err| err.with_context("stage", "evaluate"))?;
    if values.len() != items.len() {
        return Err(DpmError::Consistency(
            ErrorInfo::new("oracle-length-mismatch", "oracle returned misaligned likelihoods")
                .with_context("expected", items.len())
                .with_context("returned", values.len()),
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionBounds;

    #[derive(Debug, Default)]
    struct ClusterOnly;

    impl LikelihoodOracle for ClusterOnly {
        fn restrict_to(&mut self, _items: &[usize]) -> Result<(), DpmError> {
            Ok(())
        }

        fn evaluate(
            &mut self,
            params: &ClusterParams,
            items: &[usize],
        ) -> Result<Vec<f64>, DpmError> {
            Ok(items.iter().map(|_| -params.rate).collect())
        }

        fn cached_by_cluster(
            &self,
            partition: &ClusterPartition,
            cluster: ClusterId,
            _item: usize,
        ) -> Result<f64, DpmError> {
            Ok(-partition.params(cluster)?.rate)
        }
    }

    fn partition() -> ClusterPartition {
        let params = ClusterParams {
            rate: 2.0,
            shape: 1.0,
            invariant_proportion: 0.1,
            model_choice: 3,
        };
        ClusterPartition::new(&[0, 0], &[params], PartitionBounds::default()).unwrap()
    }

    #[test]
    fn cluster_only_oracle_resolves_to_cluster_lookup() {
        let oracle = ClusterOnly;
        let partition = partition();
        assert_eq!(CachedLookup::resolve(&oracle), CachedLookup::ByCluster);
        let values = CachedLookup::ByCluster
            .site_log_likelihoods(&oracle, &partition, ClusterId::from_raw(0), &[0, 1])
            .unwrap();
        assert_eq!(values, vec![-2.0, -2.0]);
    }

    #[test]
    fn parameter_lookup_is_unsupported_by_default() {
        let oracle = ClusterOnly;
        let err = CachedLookup::ByParameter
            .site_log_likelihood(&oracle, &partition(), ClusterId::from_raw(0), 1)
            .unwrap_err();
        assert_eq!(err.info().code, "lookup-unsupported");
        assert_eq!(err.info().context["lookup"], "ByParameter");
        assert_eq!(err.info().context["item"], "1");
    }
}
