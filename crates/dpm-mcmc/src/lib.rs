#![deny(missing_docs)]

//! Split-merge proposals for Dirichlet-process mixtures of site models.
//!
//! Items (alignment sites) are partitioned into clusters that share a rate, a
//! gamma shape, an invariant-site proportion and a discrete site-model
//! indicator. [`SplitMergeProposer`] evaluates a split or merge of the
//! partition into an immutable [`MoveCandidate`] carrying the log proposal
//! ratio, and can commit it eagerly. [`DependentModelSync`] keeps a derived
//! per-cluster model layer aligned with the partition's change tags.

/// Sequential allocation shared by split and merge proposals.
pub mod allocation;
/// Partition checkpoint payloads and JSON persistence.
pub mod checkpoint;
/// YAML configuration schema and defaults.
pub mod config;
/// Deterministic seed derivation helpers.
pub mod determinism;
/// Continuous random-walk kernels.
pub mod moves_continuous;
/// Discrete neighbor kernel over the site-model indicator.
pub mod moves_discrete;
/// Likelihood oracle contract.
pub mod oracle;
/// Cluster partition and parameter lists.
pub mod partition;
/// Split-merge proposer.
pub mod split_merge;
/// Log-likelihood stabilization.
pub mod stabilizer;
/// Derived-model synchronization.
pub mod sync;

pub use allocation::{Allocation, AllocationStep, SequentialAllocationSampler, Side};
pub use checkpoint::{checkpoint_path, PartitionCheckpoint};
pub use config::{DiscreteConfig, ProposalFamily, ProposerConfig, RandomWalkConfig};
pub use moves_continuous::{ContinuousRandomWalkKernel, GaussianProposal, UniformProposal};
pub use moves_discrete::{DiscreteNeighborKernel, NeighborGraph};
pub use oracle::{CachedLookup, LikelihoodOracle};
pub use partition::{Bounds, ChangeType, ClusterParams, ClusterPartition, PartitionBounds};
pub use split_merge::{MoveCandidate, MoveKind, ProposalOutcome, SplitMergeKernels, SplitMergeProposer};
pub use stabilizer::{stabilize, StabilizeMode};
pub use sync::{DependentModelSync, DerivedModel, GammaSiteModel, SyncAction};
