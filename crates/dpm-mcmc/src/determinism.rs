use dpm_core::{derive_substream_seed, RngHandle};

/// Seed of one independent chain run from the same master seed.
pub fn chain_seed(master_seed: u64, chain: usize) -> u64 {
    derive_substream_seed(master_seed ^ 0xA5A5_A5A5_A5A5_A5A5, chain as u64)
}

/// Seed of the proposal made at `step` of a chain.
pub fn step_seed(chain_seed: u64, step: usize) -> u64 {
    derive_substream_seed(chain_seed, step as u64)
}

/// RNG reproducing the proposal made at `step`.
pub fn step_rng(chain_seed: u64, step: usize) -> RngHandle {
    RngHandle::from_seed(step_seed(chain_seed, step))
}
