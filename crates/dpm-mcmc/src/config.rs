use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use dpm_core::errors::ErrorInfo;
use dpm_core::DpmError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::moves_continuous::{
    ContinuousRandomWalkKernel, GaussianProposal, ProposalDistribution, UniformProposal, WalkSpace,
};
use crate::moves_discrete::{DiscreteNeighborKernel, NeighborGraph, UniformNeighborCategorical};
use crate::partition::{Bounds, PartitionBounds};
use crate::split_merge::SplitMergeKernels;
use crate::stabilizer::DEFAULT_UNDERFLOW_THRESHOLD;

/// YAML-configurable settings of the split-merge proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerConfig {
    /// Log-space walk for cluster rates.
    #[serde(default = "default_log_walk", deserialize_with = "log_walk")]
    pub rate: RandomWalkConfig,
    /// Log-space walk for gamma shapes.
    #[serde(default = "default_log_walk", deserialize_with = "log_walk")]
    pub shape: RandomWalkConfig,
    /// Linear walk for invariant proportions.
    #[serde(default = "default_linear_walk", deserialize_with = "linear_walk")]
    pub invariant_proportion: RandomWalkConfig,
    /// Neighbor kernel for the site-model indicator.
    #[serde(default)]
    pub model_choice: DiscreteConfig,
    /// Recomputes every allocated item's likelihood and compares it bit-for-bit.
    #[serde(default)]
    pub check_consistency: bool,
    /// Likelihood below which the stabilizer rescales a pair.
    #[serde(default = "default_underflow_threshold")]
    pub underflow_threshold: f64,
}

fn default_log_walk() -> RandomWalkConfig {
    RandomWalkConfig {
        family: ProposalFamily::Gaussian,
        scale: 0.5,
        lower: Some(0.0),
        upper: None,
    }
}

fn default_linear_walk() -> RandomWalkConfig {
    RandomWalkConfig {
        family: ProposalFamily::Gaussian,
        scale: 0.1,
        lower: Some(0.0),
        upper: Some(1.0),
    }
}

/// Fields a document sets on one walk; absent ones keep the kernel's defaults.
///
/// An explicit `null` bound means unbounded, an absent one keeps the default.
#[derive(Deserialize)]
struct WalkOverrides {
    family: Option<ProposalFamily>,
    scale: Option<f64>,
    #[serde(default, deserialize_with = "present")]
    lower: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    upper: Option<Option<f64>>,
}

impl WalkOverrides {
    fn over(self, base: RandomWalkConfig) -> RandomWalkConfig {
        RandomWalkConfig {
            family: self.family.unwrap_or(base.family),
            scale: self.scale.unwrap_or(base.scale),
            lower: self.lower.unwrap_or(base.lower),
            upper: self.upper.unwrap_or(base.upper),
        }
    }
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Option<f64>>, D::Error> {
    Option::<f64>::deserialize(deserializer).map(Some)
}

fn log_walk<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RandomWalkConfig, D::Error> {
    WalkOverrides::deserialize(deserializer).map(|walk| walk.over(default_log_walk()))
}

fn linear_walk<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RandomWalkConfig, D::Error> {
    WalkOverrides::deserialize(deserializer).map(|walk| walk.over(default_linear_walk()))
}

fn default_underflow_threshold() -> f64 {
    DEFAULT_UNDERFLOW_THRESHOLD
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            rate: default_log_walk(),
            shape: default_log_walk(),
            invariant_proportion: default_linear_walk(),
            model_choice: DiscreteConfig::default(),
            check_consistency: false,
            underflow_threshold: default_underflow_threshold(),
        }
    }
}

/// Increment family of a continuous random walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalFamily {
    /// Centred normal increments; `scale` is the standard deviation.
    #[default]
    Gaussian,
    /// Uniform increments; `scale` is the half width.
    Uniform,
}

/// Settings of one continuous random-walk kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomWalkConfig {
    /// Increment family.
    #[serde(default)]
    pub family: ProposalFamily,
    /// Scale of the increments.
    pub scale: f64,
    /// Lower bound of the parameter; `None` is unbounded.
    #[serde(default)]
    pub lower: Option<f64>,
    /// Upper bound of the parameter; `None` is unbounded.
    #[serde(default)]
    pub upper: Option<f64>,
}

impl RandomWalkConfig {
    /// Declared bounds of the parameter.
    pub fn bounds(&self) -> Result<Bounds, DpmError> {
        Bounds::new(
            self.lower.unwrap_or(f64::NEG_INFINITY),
            self.upper.unwrap_or(f64::INFINITY),
        )
    }

    fn kernel(&self, space: WalkSpace) -> Result<ContinuousRandomWalkKernel, DpmError> {
        fn build(
            space: WalkSpace,
            distribution: impl ProposalDistribution + 'static,
        ) -> ContinuousRandomWalkKernel {
            match space {
                WalkSpace::Log => ContinuousRandomWalkKernel::log_space(distribution),
                WalkSpace::Linear => ContinuousRandomWalkKernel::linear(distribution),
            }
        }
        let kernel = match self.family {
            ProposalFamily::Gaussian => build(space, GaussianProposal::new(self.scale)?),
            ProposalFamily::Uniform => build(space, UniformProposal::new(self.scale)?),
        };
        Ok(kernel)
    }
}

/// Settings of the discrete model-choice kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteConfig {
    /// Value held by slot zero of the density table.
    #[serde(default = "default_offset")]
    pub offset: i64,
    /// Symmetric neighbor lists keyed by indicator value.
    #[serde(default = "default_adjacency")]
    pub adjacency: BTreeMap<i64, Vec<i64>>,
}

fn default_offset() -> i64 {
    1
}

fn default_adjacency() -> BTreeMap<i64, Vec<i64>> {
    NeighborGraph::site_model_network().adjacency().clone()
}

impl Default for DiscreteConfig {
    fn default() -> Self {
        Self {
            offset: default_offset(),
            adjacency: default_adjacency(),
        }
    }
}

impl DiscreteConfig {
    fn kernel(&self) -> Result<DiscreteNeighborKernel, DpmError> {
        let graph = NeighborGraph::new(self.adjacency.clone())?;
        let Some(max) = graph.values().last() else {
            return Err(config_error("empty-adjacency", "neighbor graph has no values"));
        };
        if let Some(min) = graph.values().next().filter(|min| *min < self.offset) {
            return Err(config_error(
                "offset-above-domain",
                "indicator values must not lie below the offset",
            )
            .with_context("offset", self.offset)
            .with_context("value", min));
        }
        let domain_size = (max - self.offset + 1) as usize;
        Ok(DiscreteNeighborKernel::new(
            graph,
            UniformNeighborCategorical::new(self.offset, domain_size),
        ))
    }
}

impl ProposerConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DpmError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| DpmError::Config(ErrorInfo::new("config-parse", err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML file.
    pub fn load(path: &Path) -> Result<Self, DpmError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DpmError::Config(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&contents).map_err(|err| err.with_context("path", path.display()))
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml_string(&self) -> Result<String, DpmError> {
        serde_yaml::to_string(self)
            .map_err(|err| DpmError::Serde(ErrorInfo::new("config-serialize", err.to_string())))
    }

    /// Checks scalar settings that serde cannot express.
    pub fn validate(&self) -> Result<(), DpmError> {
        if !(self.underflow_threshold.is_finite() && self.underflow_threshold > 0.0) {
            return Err(config_error(
                "invalid-underflow-threshold",
                "underflow threshold must be positive and finite",
            )
            .with_context("threshold", self.underflow_threshold));
        }
        self.partition_bounds()?;
        Ok(())
    }

    /// Bounds applied to the four parameter lists.
    pub fn partition_bounds(&self) -> Result<PartitionBounds, DpmError> {
        Ok(PartitionBounds {
            rate: self.rate.bounds()?,
            shape: self.shape.bounds()?,
            invariant_proportion: self.invariant_proportion.bounds()?,
            model_choice: Bounds::unbounded(),
        })
    }

    /// Builds and validates the four proposal kernels.
    pub fn build_kernels(&self) -> Result<SplitMergeKernels, DpmError> {
        let tag = |name: &'static str| move |err: DpmError| err.with_context("parameter", name);
        Ok(SplitMergeKernels {
            rate: self.rate.kernel(WalkSpace::Log).map_err(tag("rate"))?,
            shape: self.shape.kernel(WalkSpace::Log).map_err(tag("shape"))?,
            invariant_proportion: self
                .invariant_proportion
                .kernel(WalkSpace::Linear)
                .map_err(tag("invariant-proportion"))?,
            model_choice: self.model_choice.kernel().map_err(tag("model-choice"))?,
        })
    }
}

fn config_error(code: &str, message: &str) -> DpmError {
    DpmError::Config(ErrorInfo::new(code, message))
}
