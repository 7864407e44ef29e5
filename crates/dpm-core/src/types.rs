use std::fmt;

use serde::{Deserialize, Serialize};

/// Positional identifier of a cluster within the parameter lists.
///
/// Cluster ids are dense: a partition with `k` clusters uses ids `0..k`. A
/// merge removes the absorbed slot, so every id above it shifts down by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(usize);

impl ClusterId {
    /// Creates a new identifier from its raw position.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw position of the cluster.
    pub fn as_raw(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Stable identity of a cluster parameter, assigned once when the cluster is created.
///
/// Unlike [`ClusterId`], a parameter identity never changes when other
/// clusters are merged away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(u64);

impl ParameterId {
    /// Creates a new identity from its raw integer representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer representation of the identity.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}
