//! Property tests: the decision depends only on the set of verdicts

mod common;

use chatguard_arbiter::{Arbiter, ArbiterConfig, FallbackPolicy, Ruling};
use chatguard_core::{Classification, Decision, Verdict, VerdictSet};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::{verdict, Pipeline};
use proptest::prelude::*;
use std::time::Duration;

const STAGES: [&str; 4] = ["heuristic", "llm", "llm-b", "media"];

fn classification() -> impl Strategy<Value = Classification> {
    prop_oneof![
        Just(Classification::Clean),
        Just(Classification::Violation),
        Just(Classification::Uncertain),
    ]
}

/// At most one verdict per stage, in generation order
fn verdicts() -> impl Strategy<Value = Vec<Verdict>> {
    prop::collection::vec(
        prop::option::of((classification(), prop::option::of(0u8..=10))),
        STAGES.len(),
    )
    .prop_map(|slots| {
        slots
            .into_iter()
            .zip(STAGES)
            .filter_map(|(slot, stage)| {
                slot.map(|(class, confidence)| {
                    verdict(
                        "M1",
                        stage,
                        class,
                        confidence.map(|c| c as f32 / 10.0),
                        &format!("{} reason", stage),
                    )
                })
            })
            .collect()
    })
}

fn policy(fallback: FallbackPolicy) -> Arbiter {
    Arbiter::new(ArbiterConfig {
        expected_stages: STAGES.iter().map(|s| s.to_string()).collect(),
        fallback,
        ..ArbiterConfig::default()
    })
}

fn fallback() -> impl Strategy<Value = FallbackPolicy> {
    prop_oneof![Just(FallbackPolicy::FailOpen), Just(FallbackPolicy::FailClosed)]
}

/// Feed verdicts to a fresh arbiter worker, then sweep past the window
fn run_worker(order: &[Verdict], fallback: FallbackPolicy) -> Vec<Decision> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let pipeline = Pipeline::new();
        let arbiter = pipeline.arbiter(
            "prop",
            ArbiterConfig {
                expected_stages: STAGES.iter().map(|s| s.to_string()).collect(),
                fallback,
                ..ArbiterConfig::default()
            },
        );
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        for v in order {
            arbiter.handle_verdict(v, start).await.unwrap();
        }
        arbiter.sweep(start + ChronoDuration::seconds(31)).await.unwrap();

        pipeline.drain_decisions().await
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_ruling_ignores_arrival_order(
        (original, shuffled) in verdicts().prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
        fallback in fallback(),
        elapsed_ms in 0u64..60_000,
    ) {
        let policy = policy(fallback);
        let elapsed = Duration::from_millis(elapsed_ms);

        let a: VerdictSet = original.into_iter().collect();
        let b: VerdictSet = shuffled.into_iter().collect();

        prop_assert_eq!(policy.evaluate(&a, elapsed), policy.evaluate(&b, elapsed));
    }

    #[test]
    fn prop_replay_is_idempotent(
        verdicts in verdicts(),
        repeats in 1usize..4,
        fallback in fallback(),
    ) {
        let policy = policy(fallback);
        let once: VerdictSet = verdicts.iter().cloned().collect();
        let replayed: VerdictSet = std::iter::repeat(verdicts.clone())
            .take(repeats + 1)
            .flatten()
            .collect();

        prop_assert_eq!(
            policy.evaluate(&once, Duration::from_secs(31)),
            policy.evaluate(&replayed, Duration::from_secs(31))
        );
    }

    #[test]
    fn prop_window_always_decides(verdicts in verdicts(), fallback in fallback()) {
        let set: VerdictSet = verdicts.into_iter().collect();
        let ruling = policy(fallback).evaluate(&set, Duration::from_secs(30));
        prop_assert!(matches!(ruling, Ruling::Decide(_)));
    }

    #[test]
    fn prop_worker_commits_one_order_independent_decision(
        (original, shuffled) in verdicts()
            .prop_filter("at least one verdict", |v| !v.is_empty())
            .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle())),
        fallback in fallback(),
    ) {
        // Redeliver every verdict once more at the end of the stream
        let mut replayed = shuffled.clone();
        replayed.extend(shuffled.iter().cloned());

        let first = run_worker(&original, fallback);
        let second = run_worker(&replayed, fallback);

        prop_assert_eq!(first.len(), 1);
        prop_assert_eq!(second.len(), 1);
        prop_assert_eq!(&first[0], &second[0]);
    }
}
