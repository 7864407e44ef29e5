use std::fs;
use std::path::{Path, PathBuf};

use dpm_core::errors::ErrorInfo;
use dpm_core::{ClusterId, DpmError};
use serde::{Deserialize, Serialize};

use crate::partition::{Bounds, ClusterParameterList, ClusterPartition, ClusterSlot, ParameterKind};

/// Bounds in a JSON-safe form; an absent side is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsRecord {
    /// Finite lower bound, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    /// Finite upper bound, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
}

impl From<Bounds> for BoundsRecord {
    fn from(bounds: Bounds) -> Self {
        Self {
            lower: Some(bounds.lower).filter(|v| v.is_finite()),
            upper: Some(bounds.upper).filter(|v| v.is_finite()),
        }
    }
}

impl BoundsRecord {
    fn to_bounds(self) -> Result<Bounds, DpmError> {
        Bounds::new(
            self.lower.unwrap_or(f64::NEG_INFINITY),
            self.upper.unwrap_or(f64::INFINITY),
        )
    }
}

/// One serialized parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord<V> {
    /// Declared bounds.
    pub bounds: BoundsRecord,
    /// Slots in cluster order.
    pub slots: Vec<ClusterSlot<V>>,
}

impl<V: Clone + std::fmt::Debug> ListRecord<V> {
    fn capture(list: &ClusterParameterList<V>) -> Self {
        Self {
            bounds: list.bounds().into(),
            slots: list.slots().to_vec(),
        }
    }

    fn rebuild(&self, kind: ParameterKind) -> Result<ClusterParameterList<V>, DpmError> {
        let bounds = self
            .bounds
            .to_bounds()
            .map_err(|err| err.with_context("list", kind.as_str()))?;
        Ok(ClusterParameterList::new(kind, bounds, self.slots.clone()))
    }
}

/// Serializable snapshot of a [`ClusterPartition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    /// Chain step at which the snapshot was taken.
    pub step: usize,
    /// Master seed of the chain.
    pub master_seed: u64,
    /// Item to cluster map.
    pub pointers: Vec<ClusterId>,
    /// Rate list.
    pub rates: ListRecord<f64>,
    /// Shape list.
    pub shapes: ListRecord<f64>,
    /// Invariant-proportion list.
    pub invariant_proportions: ListRecord<f64>,
    /// Model-choice list.
    pub model_choices: ListRecord<i64>,
    /// Next parameter identity a split hands out.
    pub next_parameter: u64,
}

impl PartitionCheckpoint {
    /// Snapshots the current content of `partition`.
    pub fn capture(partition: &ClusterPartition, step: usize, master_seed: u64) -> Self {
        Self {
            step,
            master_seed,
            pointers: partition.pointers().to_vec(),
            rates: ListRecord::capture(partition.rates()),
            shapes: ListRecord::capture(partition.shapes()),
            invariant_proportions: ListRecord::capture(partition.invariant_proportions()),
            model_choices: ListRecord::capture(partition.model_choices()),
            next_parameter: partition.next_parameter(),
        }
    }

    /// Rebuilds a clean, validated partition.
    pub fn restore(&self) -> Result<ClusterPartition, DpmError> {
        ClusterPartition::from_parts(
            self.pointers.clone(),
            self.rates.rebuild(ParameterKind::Rate)?,
            self.shapes.rebuild(ParameterKind::Shape)?,
            self.invariant_proportions
                .rebuild(ParameterKind::InvariantProportion)?,
            self.model_choices.rebuild(ParameterKind::ModelChoice)?,
            self.next_parameter,
        )
        .map_err(|err| err.with_context("step", self.step))
    }

    /// Restores the payload from disk.
    pub fn load(path: &Path) -> Result<Self, DpmError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DpmError::Serde(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            DpmError::Serde(
                ErrorInfo::new("checkpoint-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the payload to disk.
    pub fn store(&self, path: &Path) -> Result<(), DpmError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DpmError::Serde(
                    ErrorInfo::new("checkpoint-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            DpmError::Serde(
                ErrorInfo::new("checkpoint-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            DpmError::Serde(
                ErrorInfo::new("checkpoint-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}

/// Checkpoint file for `step` under `root`.
pub fn checkpoint_path(root: &Path, step: usize) -> PathBuf {
    root.join(format!("ckpt_{step:05}.json"))
}
