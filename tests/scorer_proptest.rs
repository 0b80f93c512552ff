//! Property tests for the proxy pool scorer
//!
//! The central invariant: after any sequence of success/failure reports,
//! the endpoint file on disk lists exactly the endpoints held in memory,
//! in the same order.

use std::time::Duration;

use proptest::prelude::*;

use propharvest::proxy::{Protocol, ProxyEndpoint, ProxyScorer, ScorerConfig, Selection};

fn endpoint(port: u16) -> ProxyEndpoint {
    let mut ep = ProxyEndpoint::new(Protocol::Http, "203.0.113.10", port);
    ep.latency = Some(Duration::from_millis(250));
    ep
}

fn file_lines(scorer_dir: &std::path::Path) -> Vec<String> {
    match std::fs::read_to_string(scorer_dir.join("endpoints.txt")) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// File mirrors memory after every operation, for any outcome sequence
    #[test]
    fn file_mirrors_memory(outcomes in proptest::collection::vec(any::<bool>(), 1..60)) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = ProxyScorer::new(ScorerConfig {
            endpoint_file: dir.path().join("endpoints.txt"),
            score_file: dir.path().join("scores.json"),
        });
        scorer
            .replace_all((0..5).map(|i| endpoint(8080 + i)).collect())
            .expect("seed pool");

        for success in outcomes {
            let Some(selection) = scorer.select(None) else {
                break; // pool fully pruned; nothing left to report on
            };
            if success {
                scorer.record_success(&selection).expect("record success");
            } else {
                scorer.record_failure(&selection).expect("record failure");
            }

            let in_memory: Vec<String> = scorer
                .endpoints()
                .iter()
                .map(ProxyEndpoint::to_line)
                .collect();
            prop_assert_eq!(file_lines(dir.path()), in_memory);
        }
    }

    /// Pruning shifts subsequent indices down by one, preserving order
    #[test]
    fn prune_preserves_relative_order(victim in 0usize..5) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = ProxyScorer::new(ScorerConfig {
            endpoint_file: dir.path().join("endpoints.txt"),
            score_file: dir.path().join("scores.json"),
        });
        scorer
            .replace_all((0..5).map(|i| endpoint(8080 + i)).collect())
            .expect("seed pool");

        let before: Vec<String> = scorer.endpoints().iter().map(ProxyEndpoint::key).collect();
        let selection = Selection {
            endpoint: endpoint(8080 + victim as u16),
            index: victim,
        };
        // Three failures prune the victim
        for _ in 0..3 {
            scorer.record_failure(&selection).expect("record failure");
        }

        let after: Vec<String> = scorer.endpoints().iter().map(ProxyEndpoint::key).collect();
        let expected: Vec<String> = before
            .iter()
            .filter(|key| **key != selection.endpoint.key())
            .cloned()
            .collect();
        prop_assert_eq!(after, expected);
    }

    /// Selection always returns a valid index into the current list
    #[test]
    fn selection_index_is_live(excluded in proptest::option::of(0usize..6)) {
        let dir = tempfile::tempdir().expect("tempdir");
        let scorer = ProxyScorer::new(ScorerConfig {
            endpoint_file: dir.path().join("endpoints.txt"),
            score_file: dir.path().join("scores.json"),
        });
        scorer
            .replace_all((0..4).map(|i| endpoint(9000 + i)).collect())
            .expect("seed pool");

        if let Some(selection) = scorer.select(excluded) {
            let endpoints = scorer.endpoints();
            prop_assert!(selection.index < endpoints.len());
            prop_assert_eq!(endpoints[selection.index].key(), selection.endpoint.key());
        }
    }
}
