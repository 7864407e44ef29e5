mod common;

use common::{params, partition, proposer, SyntheticOracle};
use dpm_core::{ClusterId, DpmError, RngHandle};
use dpm_mcmc::split_merge::PartitionMutation;
use dpm_mcmc::{CachedLookup, MoveKind, ProposalOutcome};

#[test]
fn different_clusters_enter_merge_and_keep_second_pivot_params() {
    let mut partition = partition(&[0, 0, 1], &[params(1.0, 3), params(2.5, 4)]);
    let mut proposer = proposer(SyntheticOracle::by_cluster());
    let mut rng = RngHandle::from_seed(11);

    let outcome = proposer
        .propose_with_pivots(&mut partition, 0, 2, &mut rng)
        .unwrap();

    let ProposalOutcome::Applied { kind, cluster, .. } = outcome else {
        panic!("merge rejected: {outcome:?}");
    };
    assert_eq!(kind, MoveKind::Merge);
    assert_eq!(partition.cluster_count(), 1);
    assert_eq!(cluster, ClusterId::from_raw(0));
    assert_eq!(partition.params(cluster).unwrap(), params(2.5, 4));
    assert_eq!(partition.cluster_of(1).unwrap(), cluster);
    partition.validate().unwrap();
}

#[test]
fn proposer_never_pairs_an_item_with_itself() {
    let partition = partition(&[0, 1, 1, 0, 2], &[params(1.0, 3), params(2.0, 4), params(0.7, 2)]);
    let mut proposer = proposer(SyntheticOracle::by_cluster());
    let mut rng = RngHandle::from_seed(3);
    for _ in 0..200 {
        let candidate = proposer.candidate(&partition, &mut rng).unwrap();
        assert_ne!(candidate.pivots.0, candidate.pivots.1);
    }
    let err = proposer
        .candidate_for_pivots(&partition, 2, 2, &mut rng)
        .unwrap_err();
    assert_eq!(err.info().code, "identical-pivots");
}

#[test]
fn split_followed_by_merge_round_trips() {
    let original = partition(&[0, 0, 0, 1], &[params(1.2, 3), params(2.0, 4)]);
    let mut partition = original.clone();
    let mut proposer = proposer(SyntheticOracle::by_cluster()).with_consistency_check(true);
    let mut rng = RngHandle::from_seed(5);

    let split = proposer
        .propose_with_pivots(&mut partition, 0, 1, &mut rng)
        .unwrap();
    assert_eq!(split.kind(), MoveKind::Split);
    assert!(split.is_applied());
    assert_eq!(partition.cluster_count(), 3);
    assert_eq!(partition.cluster_of(0).unwrap(), ClusterId::from_raw(2));
    assert_eq!(partition.cluster_of(1).unwrap(), ClusterId::from_raw(0));

    let merge = proposer
        .propose_with_pivots(&mut partition, 0, 1, &mut rng)
        .unwrap();
    assert_eq!(merge.kind(), MoveKind::Merge);
    assert!(merge.is_applied());
    assert!((merge.log_hastings_ratio() + split.log_hastings_ratio()).abs() < 1e-9);
    assert_eq!(partition.pointers(), original.pointers());
    for position in 0..2 {
        let cluster = ClusterId::from_raw(position);
        assert_eq!(partition.params(cluster).unwrap(), original.params(cluster).unwrap());
        assert_eq!(
            partition.parameter_id(cluster).unwrap(),
            original.parameter_id(cluster).unwrap()
        );
    }
}

#[test]
fn larger_split_is_undone_by_the_matching_merge() {
    let original = partition(
        &[0, 0, 0, 0, 0, 0, 1],
        &[params(1.4, 2), params(0.6, 4)],
    );
    let mut proposer = proposer(SyntheticOracle::by_parameter());
    for seed in 0..16 {
        let mut partition = original.clone();
        let mut rng = RngHandle::from_seed(seed);

        let split = proposer
            .propose_with_pivots(&mut partition, 0, 1, &mut rng)
            .unwrap();
        let ProposalOutcome::Applied { cluster, .. } = split else {
            panic!("split rejected: {split:?}");
        };
        assert_eq!(cluster, ClusterId::from_raw(2));
        assert!(partition.members(cluster).contains(&0));
        assert!(!partition.members(cluster).contains(&1));

        let merge = proposer
            .propose_with_pivots(&mut partition, 0, 1, &mut rng)
            .unwrap();
        assert!(merge.is_applied(), "merge rejected: {merge:?}");
        assert_eq!(partition.pointers(), original.pointers());
        for position in 0..2 {
            let cluster = ClusterId::from_raw(position);
            assert_eq!(partition.params(cluster).unwrap(), original.params(cluster).unwrap());
        }
        partition.validate().unwrap();
    }
}

#[test]
fn unreachable_reverse_move_is_a_rejection() {
    // Indicators 1 and 5 are not neighbors, so no split could have produced this pair.
    let mut partition = partition(&[0, 0, 1, 1], &[params(1.0, 1), params(2.0, 5)]);
    let before = partition.clone();
    let mut proposer = proposer(SyntheticOracle::by_cluster());
    let mut rng = RngHandle::from_seed(9);

    let outcome = proposer
        .propose_with_pivots(&mut partition, 0, 2, &mut rng)
        .unwrap();

    assert_eq!(
        outcome,
        ProposalOutcome::Rejected {
            kind: MoveKind::Merge,
            log_hastings_ratio: f64::NEG_INFINITY,
        }
    );
    assert_eq!(partition.pointers(), before.pointers());
    assert_eq!(partition.cluster_count(), 2);
    assert_eq!(partition.change_type().unwrap(), dpm_mcmc::ChangeType::None);
}

#[test]
fn nan_likelihood_is_fatal() {
    let mut partition = partition(&[0, 0, 1, 1], &[params(1.0, 3), params(2.0, 4)]);
    let mut proposer = proposer(SyntheticOracle::by_cluster().with_override(1, f64::NAN));
    let mut rng = RngHandle::from_seed(2);

    let err = proposer
        .propose_with_pivots(&mut partition, 0, 2, &mut rng)
        .unwrap_err();

    assert!(matches!(err, DpmError::Numeric(_)));
    assert_eq!(err.info().code, "nan-log-likelihood");
    assert_eq!(err.info().context["pivot1"], "0");
    assert_eq!(partition.cluster_count(), 2);
}

#[test]
fn item_impossible_under_both_clusters_is_fatal() {
    let mut partition = partition(&[0, 0, 0], &[params(1.0, 3)]);
    let mut proposer =
        proposer(SyntheticOracle::by_cluster().with_override(2, f64::NEG_INFINITY));
    let mut rng = RngHandle::from_seed(2);

    let err = proposer
        .propose_with_pivots(&mut partition, 0, 1, &mut rng)
        .unwrap_err();

    assert_eq!(err.info().code, "degenerate-log-likelihood");
    assert_eq!(partition.cluster_count(), 1);
}

#[test]
fn stale_cache_is_reported_by_the_self_check() {
    let mut partition = partition(&[0, 0, 0, 0], &[params(1.0, 3)]);
    let mut proposer =
        proposer(SyntheticOracle::by_cluster().with_cache_drift(1e-6)).with_consistency_check(true);
    let mut rng = RngHandle::from_seed(4);

    let err = proposer
        .propose_with_pivots(&mut partition, 0, 1, &mut rng)
        .unwrap_err();

    assert!(err.is_consistency());
    assert_eq!(err.info().code, "likelihood-mismatch");
    assert_eq!(err.info().context["position"], "0");
    assert_eq!(err.info().context["cluster_second"], "c0");
    assert_eq!(err.info().context["cluster_first"], "c1");
    assert!(["2", "3"].contains(&err.info().context["item"].as_str()));
}

#[test]
fn stale_cache_goes_unnoticed_without_the_self_check() {
    let mut partition = partition(&[0, 0, 0, 0], &[params(1.0, 3)]);
    let mut proposer = proposer(SyntheticOracle::by_cluster().with_cache_drift(1e-6));
    let mut rng = RngHandle::from_seed(4);
    assert!(proposer
        .propose_with_pivots(&mut partition, 0, 1, &mut rng)
        .is_ok());
}

#[test]
fn lookup_capability_is_resolved_once_and_agrees() {
    let start = partition(&[0, 1, 1, 0, 2, 2], &[params(1.0, 3), params(2.0, 4), params(0.6, 2)]);
    let mut by_cluster = proposer(SyntheticOracle::by_cluster());
    let mut by_parameter = proposer(SyntheticOracle::by_parameter());
    assert_eq!(by_cluster.lookup(), CachedLookup::ByCluster);
    assert_eq!(by_parameter.lookup(), CachedLookup::ByParameter);

    let mut left = start.clone();
    let mut right = start;
    let mut rng_left = RngHandle::from_seed(77);
    let mut rng_right = RngHandle::from_seed(77);
    for _ in 0..40 {
        let a = by_cluster.propose(&mut left, &mut rng_left).unwrap();
        let b = by_parameter.propose(&mut right, &mut rng_right).unwrap();
        assert_eq!(a, b);
        assert_eq!(left.pointers(), right.pointers());
        left.store();
        right.store();
    }
}

#[test]
fn candidates_describe_the_edit_without_applying_it() {
    let partition = partition(&[0, 0, 0, 0, 0], &[params(1.0, 3)]);
    let mut proposer = proposer(SyntheticOracle::by_parameter());
    let mut rng = RngHandle::from_seed(13);

    let candidate = proposer
        .candidate_for_pivots(&partition, 4, 2, &mut rng)
        .unwrap();

    assert!(candidate.is_admissible());
    let PartitionMutation::Split(split) = &candidate.mutation else {
        panic!("expected a split: {candidate:?}");
    };
    assert_eq!(split.source, ClusterId::from_raw(0));
    assert_eq!(split.movers[0], 4);
    assert!(!split.movers.contains(&2));
    assert!(split.log_allocation <= 0.0);
    assert!(
        (candidate.log_hastings_ratio + split.log_allocation + split.log_kernel_density).abs()
            < 1e-12
    );
    assert_eq!(partition.cluster_count(), 1);

    let mut applied = partition.clone();
    let cluster = candidate.apply(&mut applied).unwrap();
    assert_eq!(cluster, ClusterId::from_raw(1));
    assert_eq!(applied.members(cluster), {
        let mut movers = split.movers.clone();
        movers.sort_unstable();
        movers
    });
}
