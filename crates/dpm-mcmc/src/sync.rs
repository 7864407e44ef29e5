//! Keeps per-cluster derived models in lockstep with a [`ClusterPartition`].

use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError, ParameterId};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::partition::{ChangeType, ClusterParams, ClusterPartition};

/// Per-cluster object derived from the cluster's parameters.
pub trait DerivedModel {
    /// Flags the model for recomputation.
    fn mark_dirty(&mut self);

    /// Whether the model must be recomputed before use.
    fn is_dirty(&self) -> bool;

    /// Recomputes the model from its cluster's parameters and clears the flag.
    fn recompute(&mut self, params: &ClusterParams);
}

/// Site model of one cluster: gamma rate heterogeneity with invariant sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GammaSiteModel {
    parameter: ParameterId,
    params: ClusterParams,
    dirty: bool,
    recomputations: usize,
}

impl GammaSiteModel {
    /// Builds a clean model for the given parameter identity.
    pub fn new(parameter: ParameterId, params: &ClusterParams) -> Self {
        Self {
            parameter,
            params: *params,
            dirty: false,
            recomputations: 0,
        }
    }

    /// Identity of the rate parameter the model was created for.
    pub fn parameter(&self) -> ParameterId {
        self.parameter
    }

    /// Parameters seen at the last recomputation.
    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Number of recomputations since construction.
    pub fn recomputations(&self) -> usize {
        self.recomputations
    }

    /// Rate of the variable sites, scaled so the mean rate over all sites
    /// equals the cluster rate.
    pub fn variable_site_rate(&self) -> f64 {
        let variable = 1.0 - self.params.invariant_proportion;
        if variable > 0.0 {
            self.params.rate / variable
        } else {
            0.0
        }
    }
}

impl DerivedModel for GammaSiteModel {
    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn recompute(&mut self, params: &ClusterParams) {
        self.params = *params;
        self.dirty = false;
        self.recomputations += 1;
    }
}

/// Action taken by [`DependentModelSync::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "cluster", rename_all = "kebab-case")]
pub enum SyncAction {
    /// The partition was clean.
    Unchanged,
    /// A model was created at the given position.
    Inserted(ClusterId),
    /// The model at the given position was dropped.
    Removed(ClusterId),
    /// The model at the given position was marked dirty.
    MarkedDirty(ClusterId),
    /// Every model was marked dirty.
    AllDirty,
    /// The cluster count changed in bulk; this many models were rebuilt.
    Rebuilt(usize),
}

/// Derived-model layer mirroring the rate list's ordering.
///
/// [`DependentModelSync::sync`] consumes the partition's change tag once per
/// step, after the proposal committed and before the driver stores or
/// restores. [`DependentModelSync::store`] and
/// [`DependentModelSync::restore`] must follow the partition's own calls.
#[derive(Debug, Clone)]
pub struct DependentModelSync<M, F> {
    factory: F,
    models: Vec<M>,
    stored: Vec<M>,
}

impl<M, F> DependentModelSync<M, F>
where
    M: DerivedModel + Clone,
    F: Fn(ParameterId, &ClusterParams) -> M,
{
    /// Builds one model per cluster of `partition`.
    pub fn new(partition: &ClusterPartition, factory: F) -> Result<Self, DpmError> {
        let models = build_models(partition, &factory)?;
        Self::from_models(partition, models, factory)
    }

    /// Adopts existing models; there must be exactly one per cluster.
    pub fn from_models(
        partition: &ClusterPartition,
        models: Vec<M>,
        factory: F,
    ) -> Result<Self, DpmError> {
        ensure_lockstep(models.len(), partition.cluster_count())?;
        Ok(Self {
            factory,
            stored: models.clone(),
            models,
        })
    }

    /// Models in cluster order.
    pub fn models(&self) -> &[M] {
        &self.models
    }

    /// Model of `cluster`.
    pub fn model(&self, cluster: ClusterId) -> Result<&M, DpmError> {
        self.models
            .get(cluster.as_raw())
            .ok_or_else(|| out_of_range(cluster, self.models.len()))
    }

    /// Applies the partition's pending change to the model layer.
    ///
    /// The model layer is left untouched when the change does not fit the
    /// current model count.
    pub fn sync(&mut self, partition: &ClusterPartition) -> Result<SyncAction, DpmError> {
        let change = partition.change_type()?;
        let clusters = partition.cluster_count();
        let tag = |err: DpmError| err.with_context("change", format!("{change:?}"));
        let action = match change {
            ChangeType::None => {
                ensure_lockstep(self.models.len(), clusters).map_err(tag)?;
                SyncAction::Unchanged
            }
            ChangeType::Added | ChangeType::Split => {
                ensure_lockstep(self.models.len() + 1, clusters).map_err(tag)?;
                let cluster = partition
                    .last_added_id()?
                    .ok_or_else(|| missing_position(change))?;
                if cluster.as_raw() > self.models.len() {
                    return Err(out_of_range(cluster, self.models.len()));
                }
                let model = (self.factory)(
                    partition.parameter_id(cluster)?,
                    &partition.params(cluster)?,
                );
                self.models.insert(cluster.as_raw(), model);
                SyncAction::Inserted(cluster)
            }
            ChangeType::Removed | ChangeType::Merge => {
                ensure_lockstep(self.models.len(), clusters + 1).map_err(tag)?;
                let cluster = partition
                    .last_removed_id()?
                    .ok_or_else(|| missing_position(change))?;
                if cluster.as_raw() >= self.models.len() {
                    return Err(out_of_range(cluster, self.models.len()));
                }
                self.models.remove(cluster.as_raw());
                SyncAction::Removed(cluster)
            }
            ChangeType::ValueChanged => {
                ensure_lockstep(self.models.len(), clusters).map_err(tag)?;
                match partition.last_changed_id() {
                    Some(cluster) => {
                        let len = self.models.len();
                        self.models
                            .get_mut(cluster.as_raw())
                            .ok_or_else(|| out_of_range(cluster, len))?
                            .mark_dirty();
                        SyncAction::MarkedDirty(cluster)
                    }
                    None => self.mark_all_dirty(),
                }
            }
            ChangeType::All if self.models.len() == clusters => self.mark_all_dirty(),
            ChangeType::All => {
                self.models = build_models(partition, &self.factory)?;
                SyncAction::Rebuilt(clusters)
            }
        };
        debug!(?change, ?action, models = self.models.len(), "derived models synced");
        Ok(action)
    }

    /// Recomputes every dirty model from the partition; returns how many ran.
    pub fn refresh(&mut self, partition: &ClusterPartition) -> Result<usize, DpmError> {
        ensure_lockstep(self.models.len(), partition.cluster_count())?;
        let mut refreshed = 0;
        for (position, model) in self.models.iter_mut().enumerate() {
            if model.is_dirty() {
                let cluster = ClusterId::from_raw(position);
                model.recompute(&partition.params(cluster)?);
                trace!(%cluster, "derived model recomputed");
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Accepts the current models.
    pub fn store(&mut self) {
        self.stored = self.models.clone();
    }

    /// Discards every change since the last [`DependentModelSync::store`].
    pub fn restore(&mut self) {
        self.models = self.stored.clone();
    }

    fn mark_all_dirty(&mut self) -> SyncAction {
        self.models.iter_mut().for_each(|model| model.mark_dirty());
        SyncAction::AllDirty
    }
}

fn build_models<M, F>(partition: &ClusterPartition, factory: &F) -> Result<Vec<M>, DpmError>
where
    F: Fn(ParameterId, &ClusterParams) -> M,
{
    (0..partition.cluster_count())
        .map(|position| {
            let cluster = ClusterId::from_raw(position);
            Ok(factory(partition.parameter_id(cluster)?, &partition.params(cluster)?))
        })
        .collect()
}

fn ensure_lockstep(models: usize, clusters: usize) -> Result<(), DpmError> {
    if models == clusters {
        return Ok(());
    }
    Err(DpmError::Consistency(
        ErrorInfo::new(
            "model-count-mismatch",
            "derived models must match the number of clusters",
        )
        .with_context("models", models)
        .with_context("clusters", clusters),
    ))
}

fn missing_position(change: ChangeType) -> DpmError {
    DpmError::Consistency(
        ErrorInfo::new("missing-change-position", "structural change without a position")
            .with_context("change", format!("{change:?}")),
    )
}

fn out_of_range(cluster: ClusterId, models: usize) -> DpmError {
    DpmError::Consistency(
        ErrorInfo::new("model-out-of-range", "no derived model at this position")
            .with_context("cluster", cluster)
            .with_context("models", models),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionBounds;

    fn params(rate: f64) -> ClusterParams {
        ClusterParams {
            rate,
            shape: 1.0,
            invariant_proportion: 0.5,
            model_choice: 3,
        }
    }

    fn partition() -> ClusterPartition {
        ClusterPartition::new(
            &[0, 1, 1, 2],
            &[params(1.0), params(2.0), params(3.0)],
            PartitionBounds::default(),
        )
        .unwrap()
    }

    #[test]
    fn split_inserts_and_merge_removes() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        partition
            .split(ClusterId::from_raw(1), params(4.0), &[2])
            .unwrap();
        assert_eq!(
            sync.sync(&partition).unwrap(),
            SyncAction::Inserted(ClusterId::from_raw(3))
        );
        assert_eq!(sync.models()[3].params().rate, 4.0);
        partition.store();
        sync.store();

        partition
            .merge(ClusterId::from_raw(0), ClusterId::from_raw(2))
            .unwrap();
        assert_eq!(
            sync.sync(&partition).unwrap(),
            SyncAction::Removed(ClusterId::from_raw(0))
        );
        let rates: Vec<f64> = sync.models().iter().map(|m| m.params().rate).collect();
        assert_eq!(rates, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn value_change_marks_one_model() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        partition
            .rates_mut()
            .set_value(ClusterId::from_raw(2), 9.0)
            .unwrap();
        assert_eq!(
            sync.sync(&partition).unwrap(),
            SyncAction::MarkedDirty(ClusterId::from_raw(2))
        );
        assert_eq!(sync.refresh(&partition).unwrap(), 1);
        assert_eq!(sync.models()[2].params().rate, 9.0);
        assert_eq!(sync.models()[2].variable_site_rate(), 18.0);
    }

    #[test]
    fn restore_mirrors_partition() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        partition.store();
        sync.store();
        partition
            .merge(ClusterId::from_raw(1), ClusterId::from_raw(0))
            .unwrap();
        sync.sync(&partition).unwrap();
        partition.restore();
        sync.restore();
        assert_eq!(sync.models().len(), partition.cluster_count());
        assert_eq!(sync.sync(&partition).unwrap(), SyncAction::Unchanged);
    }

    #[test]
    fn add_inserts_and_remove_drops() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        let added = partition.add(params(5.0), &[1]).unwrap();
        assert_eq!(sync.sync(&partition).unwrap(), SyncAction::Inserted(added));
        assert_eq!(sync.model(added).unwrap().parameter(), ParameterId::from_raw(3));
        partition.store();
        sync.store();

        partition
            .remove(ClusterId::from_raw(2), ClusterId::from_raw(0))
            .unwrap();
        assert_eq!(
            sync.sync(&partition).unwrap(),
            SyncAction::Removed(ClusterId::from_raw(2))
        );
        let rates: Vec<f64> = sync.models().iter().map(|m| m.params().rate).collect();
        assert_eq!(rates, vec![1.0, 2.0, 5.0]);
    }

    #[test]
    fn bulk_replacement_marks_or_rebuilds() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        partition
            .replace_all(&[2, 1, 0, 0], &[params(6.0), params(7.0), params(8.0)])
            .unwrap();
        assert_eq!(sync.sync(&partition).unwrap(), SyncAction::AllDirty);
        assert!(sync.models().iter().all(|m| m.is_dirty()));
        assert_eq!(sync.refresh(&partition).unwrap(), 3);
        assert_eq!(sync.models()[2].params().rate, 8.0);
        partition.store();
        sync.store();

        partition
            .replace_all(&[0, 0, 0, 0], &[params(9.0)])
            .unwrap();
        assert_eq!(sync.sync(&partition).unwrap(), SyncAction::Rebuilt(1));
        assert_eq!(sync.models().len(), 1);
        assert_eq!(sync.models()[0].params().rate, 9.0);
        assert_eq!(sync.models()[0].parameter(), partition.parameter_id(ClusterId::from_raw(0)).unwrap());

        partition.restore();
        sync.restore();
        assert_eq!(sync.models().len(), 3);
        assert_eq!(sync.sync(&partition).unwrap(), SyncAction::Unchanged);
    }

    #[test]
    fn misaligned_change_leaves_models_untouched() {
        let mut partition = partition();
        let mut sync = DependentModelSync::new(&partition, GammaSiteModel::new).unwrap();
        partition
            .split(ClusterId::from_raw(1), params(4.0), &[2])
            .unwrap();
        sync.sync(&partition).unwrap();
        // A second sync of the same split sees one model too many.
        let err = sync.sync(&partition).unwrap_err();
        assert_eq!(err.info().code, "model-count-mismatch");
        assert_eq!(err.info().context["change"], "Split");
        assert_eq!(sync.models().len(), 4);
    }

    #[test]
    fn model_count_must_match_clusters() {
        let partition = partition();
        let err = DependentModelSync::from_models(
            &partition,
            vec![GammaSiteModel::new(ParameterId::from_raw(0), &params(1.0))],
            GammaSiteModel::new as fn(ParameterId, &ClusterParams) -> GammaSiteModel,
        )
        .unwrap_err();
        assert_eq!(err.info().code, "model-count-mismatch");
    }
}
