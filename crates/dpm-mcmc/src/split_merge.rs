use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError, RngHandle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::allocation::{AllocationStep, SequentialAllocationSampler, Side};
use crate::config::ProposerConfig;
use crate::moves_continuous::ContinuousRandomWalkKernel;
use crate::moves_discrete::DiscreteNeighborKernel;
use crate::oracle::{evaluate_scoped, CachedLookup, LikelihoodOracle};
use crate::partition::{ClusterParams, ClusterPartition};
use crate::stabilizer::{self, StabilizeMode, DEFAULT_UNDERFLOW_THRESHOLD};

/// Kind of move performed by the proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MoveKind {
    /// One cluster becomes two.
    Split,
    /// Two clusters become one.
    Merge,
}

impl MoveKind {
    /// Stable label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveKind::Split => "split",
            MoveKind::Merge => "merge",
        }
    }
}

/// The four kernels driving candidate parameters.
#[derive(Debug)]
pub struct SplitMergeKernels {
    /// Log-space walk for rates.
    pub rate: ContinuousRandomWalkKernel,
    /// Log-space walk for shapes.
    pub shape: ContinuousRandomWalkKernel,
    /// Linear walk for invariant proportions.
    pub invariant_proportion: ContinuousRandomWalkKernel,
    /// Neighbor kernel for the model indicator.
    pub model_choice: DiscreteNeighborKernel,
}

/// Pending split of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitCandidate {
    /// Cluster being split; it keeps its parameters.
    pub source: ClusterId,
    /// Parameters of the new cluster.
    pub params: ClusterParams,
    /// Items moving to the new cluster, first pivot included.
    pub movers: Vec<usize>,
    /// Log probability of the sampled allocation.
    pub log_allocation: f64,
    /// Joint log density of the four kernel draws.
    pub log_kernel_density: f64,
}

/// Pending merge of two clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    /// Cluster of the first pivot; its slot is removed.
    pub absorbed: ClusterId,
    /// Cluster of the second pivot; its parameters are kept.
    pub survivor: ClusterId,
    /// Log probability of replaying the pre-merge allocation.
    pub log_allocation: f64,
    /// Joint log density of recreating the absorbed parameters.
    pub log_kernel_density: f64,
}

/// Structural edit a candidate would perform.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionMutation {
    /// Split a cluster.
    Split(SplitCandidate),
    /// Merge two clusters.
    Merge(MergeCandidate),
}

/// Fully evaluated proposal that has not touched the partition yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveCandidate {
    /// Split or merge.
    pub kind: MoveKind,
    /// The two distinct pivot items.
    pub pivots: (usize, usize),
    /// Log proposal ratio `log q(reverse) - log q(forward)`.
    pub log_hastings_ratio: f64,
    /// Edit applied on commit.
    pub mutation: PartitionMutation,
}

impl MoveCandidate {
    /// Finite ratios may be committed; anything else is a rejection.
    pub fn is_admissible(&self) -> bool {
        self.log_hastings_ratio.is_finite()
    }

    /// Swaps the candidate into `partition`.
    ///
    /// Returns the new cluster of a split or the survivor of a merge, both
    /// numbered after the edit.
    pub fn apply(&self, partition: &mut ClusterPartition) -> Result<ClusterId, DpmError> {
        let result = match &self.mutation {
            PartitionMutation::Split(split) => {
                partition.split(split.source, split.params, &split.movers)
            }
            PartitionMutation::Merge(merge) => partition.merge(merge.absorbed, merge.survivor),
        };
        result.map_err(|err| err.with_context("move", self.kind.as_str()))
    }
}

/// Result of an eager proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ProposalOutcome {
    /// The candidate was committed to the partition.
    Applied {
        /// Move performed.
        kind: MoveKind,
        /// Log proposal ratio for the acceptance step.
        log_hastings_ratio: f64,
        /// New cluster (split) or survivor (merge) after the edit.
        cluster: ClusterId,
    },
    /// The candidate had a non-finite ratio and was discarded.
    Rejected {
        /// Move attempted.
        kind: MoveKind,
        /// The non-finite ratio.
        log_hastings_ratio: f64,
    },
}

impl ProposalOutcome {
    /// Move attempted.
    pub fn kind(&self) -> MoveKind {
        match self {
            ProposalOutcome::Applied { kind, .. } | ProposalOutcome::Rejected { kind, .. } => *kind,
        }
    }

    /// Log proposal ratio; `-inf` for a rejection.
    pub fn log_hastings_ratio(&self) -> f64 {
        match self {
            ProposalOutcome::Applied {
                log_hastings_ratio, ..
            }
            | ProposalOutcome::Rejected {
                log_hastings_ratio, ..
            } => *log_hastings_ratio,
        }
    }

    /// Whether the partition was mutated.
    pub fn is_applied(&self) -> bool {
        matches!(self, ProposalOutcome::Applied { .. })
    }
}

/// Split-merge proposer over a [`ClusterPartition`].
///
/// The proposer never undoes its own edits. A driver calls
/// [`ClusterPartition::store`] before [`SplitMergeProposer::propose`] and
/// [`ClusterPartition::restore`] when the chain rejects the step.
#[derive(Debug)]
pub struct SplitMergeProposer<O> {
    oracle: O,
    lookup: CachedLookup,
    kernels: SplitMergeKernels,
    sampler: SequentialAllocationSampler,
    underflow_threshold: f64,
    check_consistency: bool,
}

impl<O: LikelihoodOracle> SplitMergeProposer<O> {
    /// Creates a proposer, resolving the cached-likelihood lookup once.
    pub fn new(oracle: O, kernels: SplitMergeKernels) -> Self {
        let lookup = CachedLookup::resolve(&oracle);
        debug!(?lookup, "resolved cached likelihood lookup");
        Self {
            oracle,
            lookup,
            kernels,
            sampler: SequentialAllocationSampler::new(),
            underflow_threshold: DEFAULT_UNDERFLOW_THRESHOLD,
            check_consistency: false,
        }
    }

    /// Creates a proposer from a validated configuration.
    pub fn from_config(oracle: O, config: &ProposerConfig) -> Result<Self, DpmError> {
        config.validate()?;
        let mut proposer = Self::new(oracle, config.build_kernels()?);
        proposer.underflow_threshold = config.underflow_threshold;
        proposer.check_consistency = config.check_consistency;
        Ok(proposer)
    }

    /// Enables the bit-for-bit likelihood self-check.
    pub fn with_consistency_check(mut self, enabled: bool) -> Self {
        self.check_consistency = enabled;
        self
    }

    /// Lookup strategy chosen at construction.
    pub fn lookup(&self) -> CachedLookup {
        self.lookup
    }

    /// Proposal kernels.
    pub fn kernels(&self) -> &SplitMergeKernels {
        &self.kernels
    }

    /// The likelihood oracle.
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Mutable access to the likelihood oracle.
    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    /// Draws two distinct items uniformly.
    pub fn draw_pivots(
        &self,
        partition: &ClusterPartition,
        rng: &mut RngHandle,
    ) -> Result<(usize, usize), DpmError> {
        let items = partition.item_count();
        if items < 2 {
            return Err(DpmError::Consistency(
                ErrorInfo::new("too-few-items", "split-merge needs at least two items")
                    .with_context("items", items),
            ));
        }
        let index1 = rng.gen_range(0..items);
        let mut index2 = rng.gen_range(0..items);
        while index2 == index1 {
            index2 = rng.gen_range(0..items);
        }
        Ok((index1, index2))
    }

    /// Evaluates a proposal for freshly drawn pivots without mutating `partition`.
    pub fn candidate(
        &mut self,
        partition: &ClusterPartition,
        rng: &mut RngHandle,
    ) -> Result<MoveCandidate, DpmError> {
        let (index1, index2) = self.draw_pivots(partition, rng)?;
        self.candidate_for_pivots(partition, index1, index2, rng)
    }

    /// Evaluates a proposal for the given pivots without mutating `partition`.
    pub fn candidate_for_pivots(
        &mut self,
        partition: &ClusterPartition,
        index1: usize,
        index2: usize,
        rng: &mut RngHandle,
    ) -> Result<MoveCandidate, DpmError> {
        if index1 == index2 {
            return Err(DpmError::Consistency(
                ErrorInfo::new("identical-pivots", "pivot items must be distinct")
                    .with_context("item", index1),
            ));
        }
        let cluster1 = partition.cluster_of(index1)?;
        let cluster2 = partition.cluster_of(index2)?;
        let result = if cluster1 == cluster2 {
            self.split_candidate(partition, cluster1, index1, index2, rng)
        } else {
            self.merge_candidate(partition, cluster1, cluster2, index1, index2, rng)
        };
        result.map_err(|err| {
            err.with_context("pivot1", index1)
                .with_context("pivot2", index2)
        })
    }

    /// Draws pivots, evaluates the proposal and commits it when admissible.
    pub fn propose(
        &mut self,
        partition: &mut ClusterPartition,
        rng: &mut RngHandle,
    ) -> Result<ProposalOutcome, DpmError> {
        let candidate = self.candidate(partition, rng)?;
        commit(candidate, partition)
    }

    /// Same as [`SplitMergeProposer::propose`] with fixed pivots.
    pub fn propose_with_pivots(
        &mut self,
        partition: &mut ClusterPartition,
        index1: usize,
        index2: usize,
        rng: &mut RngHandle,
    ) -> Result<ProposalOutcome, DpmError> {
        let candidate = self.candidate_for_pivots(partition, index1, index2, rng)?;
        commit(candidate, partition)
    }

    fn split_candidate(
        &mut self,
        partition: &ClusterPartition,
        source: ClusterId,
        index1: usize,
        index2: usize,
        rng: &mut RngHandle,
    ) -> Result<MoveCandidate, DpmError> {
        let old = partition.params(source)?;
        let (params, log_kernel_density) = self.draw_split_params(partition, &old, rng)?;

        let mut remaining: Vec<usize> = partition
            .members(source)
            .into_iter()
            .filter(|item| *item != index1 && *item != index2)
            .collect();
        remaining.shuffle(rng);

        let log_new = self.evaluate(&params, &remaining)?;
        let log_old =
            self.lookup
                .site_log_likelihoods(&self.oracle, partition, source, &remaining)?;
        let weights = stabilizer::stabilize(
            &log_new,
            &log_old,
            StabilizeMode::Min,
            self.underflow_threshold,
        )?;

        let check = self.check_consistency.then(|| SiteCheck {
            items: &remaining,
            log_first: &log_new,
            log_second: &log_old,
            params: (params, old),
            clusters: (ClusterId::from_raw(partition.cluster_count()), source),
        });
        let oracle = &mut self.oracle;
        let allocation = self.sampler.sample(&weights, rng, |step| match &check {
            Some(check) => check.verify(oracle, step),
            None => Ok(()),
        })?;

        let mut movers = vec![index1];
        movers.extend(
            allocation
                .indices_on(Side::First)
                .into_iter()
                .map(|index| remaining[index]),
        );
        let log_q = allocation.log_probability + log_kernel_density;
        debug!(
            cluster = %source,
            movers = movers.len(),
            stays = allocation.second_count,
            log_q,
            "split candidate"
        );
        Ok(MoveCandidate {
            kind: MoveKind::Split,
            pivots: (index1, index2),
            log_hastings_ratio: -log_q,
            mutation: PartitionMutation::Split(SplitCandidate {
                source,
                params,
                movers,
                log_allocation: allocation.log_probability,
                log_kernel_density,
            }),
        })
    }

    fn draw_split_params(
        &self,
        partition: &ClusterPartition,
        old: &ClusterParams,
        rng: &mut RngHandle,
    ) -> Result<(ClusterParams, f64), DpmError> {
        let tag = |name: &'static str| move |err: DpmError| err.with_context("parameter", name);
        let kernels = &self.kernels;
        let rate = kernels
            .rate
            .propose(&[old.rate], &partition.rates().bounds(), rng)
            .map_err(tag("rate"))?;
        let shape = kernels
            .shape
            .propose(&[old.shape], &partition.shapes().bounds(), rng)
            .map_err(tag("shape"))?;
        let invariant_proportion = kernels
            .invariant_proportion
            .propose(
                &[old.invariant_proportion],
                &partition.invariant_proportions().bounds(),
                rng,
            )
            .map_err(tag("invariant-proportion"))?;
        let model_choice = kernels
            .model_choice
            .propose(old.model_choice, rng)
            .map_err(tag("model-choice"))?;
        let params = ClusterParams {
            rate: rate.value[0],
            shape: shape.value[0],
            invariant_proportion: invariant_proportion.value[0],
            model_choice: model_choice.value,
        };
        let log_density = rate.log_density
            + shape.log_density
            + invariant_proportion.log_density
            + model_choice.log_density;
        Ok((params, log_density))
    }

    fn merge_candidate(
        &mut self,
        partition: &ClusterPartition,
        absorbed: ClusterId,
        survivor: ClusterId,
        index1: usize,
        index2: usize,
        rng: &mut RngHandle,
    ) -> Result<MoveCandidate, DpmError> {
        let absorbed_params = partition.params(absorbed)?;
        let survivor_params = partition.params(survivor)?;

        let mut labelled: Vec<(usize, Side)> = partition
            .members(absorbed)
            .into_iter()
            .filter(|item| *item != index1)
            .map(|item| (item, Side::First))
            .chain(
                partition
                    .members(survivor)
                    .into_iter()
                    .filter(|item| *item != index2)
                    .map(|item| (item, Side::Second)),
            )
            .collect();
        labelled.shuffle(rng);
        let on = |side: Side| -> Vec<usize> {
            labelled
                .iter()
                .filter(|(_, label)| *label == side)
                .map(|(item, _)| *item)
                .collect()
        };
        let absorbed_items = on(Side::First);
        let survivor_items = on(Side::Second);

        // Absorbed items are evaluated under the survivor and vice versa; the
        // other halves come from the committed cache.
        let absorbed_under_survivor = self.evaluate(&survivor_params, &absorbed_items)?;
        let survivor_under_absorbed = self.evaluate(&absorbed_params, &survivor_items)?;
        let absorbed_cached =
            self.lookup
                .site_log_likelihoods(&self.oracle, partition, absorbed, &absorbed_items)?;
        let survivor_cached =
            self.lookup
                .site_log_likelihoods(&self.oracle, partition, survivor, &survivor_items)?;

        let mut log_first = Vec::with_capacity(labelled.len());
        let mut log_second = Vec::with_capacity(labelled.len());
        let mut absorbed_values = absorbed_cached.iter().zip(absorbed_under_survivor.iter());
        let mut survivor_values = survivor_under_absorbed.iter().zip(survivor_cached.iter());
        for (item, side) in &labelled {
            let next = match side {
                Side::First => absorbed_values.next(),
                Side::Second => survivor_values.next(),
            };
            let (first, second) = next.ok_or_else(|| {
                DpmError::Consistency(
                    ErrorInfo::new("merge-alignment", "merge likelihoods ran out of items")
                        .with_context("item", item),
                )
            })?;
            log_first.push(*first);
            log_second.push(*second);
        }
        let weights = stabilizer::stabilize(
            &log_first,
            &log_second,
            StabilizeMode::Max,
            self.underflow_threshold,
        )?;

        let items: Vec<usize> = labelled.iter().map(|(item, _)| *item).collect();
        let labels: Vec<Side> = labelled.iter().map(|(_, side)| *side).collect();
        let order: Vec<usize> = (0..labelled.len()).collect();
        let check = self.check_consistency.then(|| SiteCheck {
            items: &items,
            log_first: &log_first,
            log_second: &log_second,
            params: (absorbed_params, survivor_params),
            clusters: (absorbed, survivor),
        });
        let oracle = &mut self.oracle;
        let allocation = self
            .sampler
            .replay(&weights, &order, &labels, |step| match &check {
                Some(check) => check.verify(oracle, step),
                None => Ok(()),
            })?;

        let log_kernel_density = self.reverse_density(&absorbed_params, &survivor_params)?;
        let log_q = allocation.log_probability + log_kernel_density;
        debug!(
            absorbed = %absorbed,
            survivor = %survivor,
            items = labelled.len(),
            log_q,
            "merge candidate"
        );
        Ok(MoveCandidate {
            kind: MoveKind::Merge,
            pivots: (index1, index2),
            log_hastings_ratio: log_q,
            mutation: PartitionMutation::Merge(MergeCandidate {
                absorbed,
                survivor,
                log_allocation: allocation.log_probability,
                log_kernel_density,
            }),
        })
    }

    fn evaluate(&mut self, params: &ClusterParams, items: &[usize]) -> Result<Vec<f64>, DpmError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        evaluate_scoped(&mut self.oracle, params, items)
    }

    fn reverse_density(
        &self,
        removed: &ClusterParams,
        survivor: &ClusterParams,
    ) -> Result<f64, DpmError> {
        let tag = |name: &'static str| move |err: DpmError| err.with_context("parameter", name);
        let kernels = &self.kernels;
        let rate = kernels
            .rate
            .reverse_log_density(&[removed.rate], &[survivor.rate])
            .map_err(tag("rate"))?;
        let shape = kernels
            .shape
            .reverse_log_density(&[removed.shape], &[survivor.shape])
            .map_err(tag("shape"))?;
        let invariant_proportion = kernels
            .invariant_proportion
            .reverse_log_density(
                &[removed.invariant_proportion],
                &[survivor.invariant_proportion],
            )
            .map_err(tag("invariant-proportion"))?;
        let model_choice = kernels
            .model_choice
            .reverse_log_density(removed.model_choice, survivor.model_choice)
            .map_err(tag("model-choice"))?;
        Ok(rate + shape + invariant_proportion + model_choice)
    }
}

fn commit(
    candidate: MoveCandidate,
    partition: &mut ClusterPartition,
) -> Result<ProposalOutcome, DpmError> {
    if !candidate.is_admissible() {
        debug!(
            kind = candidate.kind.as_str(),
            ratio = candidate.log_hastings_ratio,
            "proposal rejected"
        );
        return Ok(ProposalOutcome::Rejected {
            kind: candidate.kind,
            log_hastings_ratio: candidate.log_hastings_ratio,
        });
    }
    let cluster = candidate.apply(partition)?;
    debug!(
        kind = candidate.kind.as_str(),
        %cluster,
        ratio = candidate.log_hastings_ratio,
        "proposal applied"
    );
    Ok(ProposalOutcome::Applied {
        kind: candidate.kind,
        log_hastings_ratio: candidate.log_hastings_ratio,
        cluster,
    })
}

/// Inputs of the diagnostic likelihood self-check.
struct SiteCheck<'a> {
    items: &'a [usize],
    log_first: &'a [f64],
    log_second: &'a [f64],
    params: (ClusterParams, ClusterParams),
    clusters: (ClusterId, ClusterId),
}

impl SiteCheck<'_> {
    fn verify<O: LikelihoodOracle + ?Sized>(
        &self,
        oracle: &mut O,
        step: &AllocationStep,
    ) -> Result<(), DpmError> {
        let item = self.items[step.index];
        let first = evaluate_scoped(oracle, &self.params.0, &[item])?[0];
        let second = evaluate_scoped(oracle, &self.params.1, &[item])?[0];
        let used_first = self.log_first[step.index];
        let used_second = self.log_second[step.index];
        if first.to_bits() == used_first.to_bits() && second.to_bits() == used_second.to_bits() {
            return Ok(());
        }
        warn!(
            item,
            position = step.position,
            cluster_first = %self.clusters.0,
            cluster_second = %self.clusters.1,
            first,
            used_first,
            second,
            used_second,
            "site likelihood differs from recomputation"
        );
        Err(DpmError::Consistency(
            ErrorInfo::new(
                "likelihood-mismatch",
                "allocation used a likelihood that differs from a fresh evaluation",
            )
            .with_context("item", item)
            .with_context("position", step.position)
            .with_context("cluster_first", self.clusters.0)
            .with_context("cluster_second", self.clusters.1)
            .with_context("recomputed_first", first)
            .with_context("used_first", used_first)
            .with_context("recomputed_second", second)
            .with_context("used_second", used_second),
        ))
    }
}
