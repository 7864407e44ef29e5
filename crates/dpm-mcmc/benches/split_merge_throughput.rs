use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use dpm_core::{ClusterId, DpmError, RngHandle};
use dpm_mcmc::determinism::{chain_seed, step_rng};
use dpm_mcmc::{
    ClusterParams, ClusterPartition, LikelihoodOracle, PartitionBounds, ProposerConfig,
    SplitMergeProposer,
};

/// Cheap closed-form oracle so the benchmark measures the proposer itself.
#[derive(Debug, Default)]
struct QuadraticOracle;

fn site(params: &ClusterParams, item: usize) -> f64 {
    let target = 0.25 * (item % 8) as f64 + 0.5;
    -(params.rate - target).powi(2) - 0.1 * params.shape
}

impl LikelihoodOracle for QuadraticOracle {
    fn restrict_to(&mut self, _items: &[usize]) -> Result<(), DpmError> {
        Ok(())
    }

    fn evaluate(&mut self, params: &ClusterParams, items: &[usize]) -> Result<Vec<f64>, DpmError> {
        Ok(items.iter().map(|item| site(params, *item)).collect())
    }

    fn cached_by_cluster(
        &self,
        partition: &ClusterPartition,
        cluster: ClusterId,
        item: usize,
    ) -> Result<f64, DpmError> {
        Ok(site(&partition.params(cluster)?, item))
    }
}

fn sample_partition(items: usize) -> ClusterPartition {
    let pointers: Vec<usize> = (0..items).map(|item| item % 4).collect();
    let clusters: Vec<ClusterParams> = (0..4)
        .map(|k| ClusterParams {
            rate: 0.5 + k as f64 * 0.5,
            shape: 1.0,
            invariant_proportion: 0.1,
            model_choice: 3,
        })
        .collect();
    ClusterPartition::new(&pointers, &clusters, PartitionBounds::default()).unwrap()
}

fn bench_proposals(c: &mut Criterion) {
    let config = ProposerConfig::default();
    let chain = chain_seed(42, 0);

    c.bench_function("split_merge_propose_256", |b| {
        let mut proposer = SplitMergeProposer::from_config(QuadraticOracle, &config).unwrap();
        b.iter_batched(
            || sample_partition(256),
            |mut partition| {
                for step in 0..16 {
                    partition.store();
                    let outcome = proposer
                        .propose(&mut partition, &mut step_rng(chain, step))
                        .unwrap();
                    if step % 2 == 1 && outcome.is_applied() {
                        partition.restore();
                    }
                }
                partition
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("split_candidate_1024", |b| {
        let mut proposer = SplitMergeProposer::from_config(QuadraticOracle, &config).unwrap();
        let partition = sample_partition(1024);
        let mut rng = RngHandle::from_seed(7);
        b.iter(|| proposer.candidate_for_pivots(&partition, 0, 4, &mut rng).unwrap())
    });
}

criterion_group!(benches, bench_proposals);
criterion_main!(benches);
