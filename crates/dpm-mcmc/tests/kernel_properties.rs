use std::collections::BTreeMap;

use dpm_core::RngHandle;
use dpm_mcmc::moves_discrete::UniformNeighborCategorical;
use dpm_mcmc::stabilizer::{stabilize_pair, DEFAULT_UNDERFLOW_THRESHOLD};
use dpm_mcmc::{DiscreteNeighborKernel, NeighborGraph, StabilizeMode};
use proptest::prelude::*;

fn ring(offset: i64, size: i64) -> NeighborGraph {
    let adjacency: BTreeMap<i64, Vec<i64>> = (0..size)
        .map(|k| {
            let prev = (k + size - 1) % size + offset;
            let next = (k + 1) % size + offset;
            (k + offset, vec![prev, next])
        })
        .collect();
    NeighborGraph::new(adjacency).unwrap()
}

proptest! {
    #[test]
    fn stabilized_weights_keep_the_likelihood_ratio(a in -600.0f64..0.0, b in -600.0f64..0.0) {
        for mode in [StabilizeMode::Min, StabilizeMode::Max] {
            let (w1, w2) = stabilize_pair(a, b, mode, DEFAULT_UNDERFLOW_THRESHOLD);
            prop_assert!(w1.is_finite() && w2.is_finite());
            prop_assert!(w1 > 0.0 && w2 > 0.0);
            let log_ratio = w1.ln() - w2.ln();
            prop_assert!((log_ratio - (a - b)).abs() < 1e-9 * (1.0 + (a - b).abs()));
        }
        let (w1, w2) = stabilize_pair(a, b, StabilizeMode::Max, DEFAULT_UNDERFLOW_THRESHOLD);
        prop_assert!(w1.max(w2) <= 1.0 + 1e-12);
    }

    #[test]
    fn site_model_proposals_are_neighbors(seed in any::<u64>(), start in 1i64..=5) {
        let kernel = DiscreteNeighborKernel::uniform(NeighborGraph::site_model_network());
        let mut rng = RngHandle::from_seed(seed);
        let draw = kernel.propose(start, &mut rng).unwrap();
        prop_assert!(kernel.graph().are_neighbors(start, draw.value));
        prop_assert!(draw.log_density.is_finite());
        prop_assert!(kernel.reverse_log_density(start, draw.value).unwrap().is_finite());
    }

    #[test]
    fn ring_proposals_are_reversible(seed in any::<u64>(), offset in -3i64..4, size in 3i64..9, start in 0i64..9) {
        let start = offset + start % size;
        let graph = ring(offset, size);
        let kernel = DiscreteNeighborKernel::new(
            graph.clone(),
            UniformNeighborCategorical::spanning(&graph),
        );
        let mut rng = RngHandle::from_seed(seed);
        let draw = kernel.propose(start, &mut rng).unwrap();
        prop_assert!(graph.are_neighbors(start, draw.value));
        let reverse = kernel.reverse_log_density(start, draw.value).unwrap();
        prop_assert!(reverse > f64::NEG_INFINITY);
    }
}
