//! Property tests for the circuit breaker state machine
//!
//! A model checker over arbitrary operation sequences: the real breaker is
//! driven alongside a reference model of the legal transition diagram, and
//! every observed edge must be legal.
//!
//! Legal edges:
//!   Closed  --(failures >= threshold)--> Open
//!   Open    --(cooldown elapsed)-------> HalfOpen
//!   HalfOpen --(success)---------------> Closed
//!   HalfOpen --(failure)---------------> Open

use std::time::Duration;

use proptest::prelude::*;

use propharvest::resilience::circuit_breaker::LocalCircuitBreaker;
use propharvest::resilience::{BreakerConfig, CircuitState};

#[derive(Debug, Clone, Copy)]
enum Op {
    Check,
    Success,
    Failure,
    WaitCooldown,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Check),
        Just(Op::Success),
        Just(Op::Failure),
        Just(Op::WaitCooldown),
    ]
}

fn legal_edge(from: CircuitState, to: CircuitState) -> bool {
    use CircuitState::{Closed, HalfOpen, Open};
    matches!(
        (from, to),
        (Closed, Closed)
            | (Closed, Open)
            | (Open, Open)
            | (Open, HalfOpen)
            | (HalfOpen, HalfOpen)
            | (HalfOpen, Closed)
            | (HalfOpen, Open)
            // record_success resets any state to Closed
            | (Open, Closed)
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No operation sequence produces an illegal transition
    #[test]
    fn no_illegal_edges(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        const DOMAIN: &str = "example.com";
        let cooldown = Duration::from_millis(10);
        let breaker = LocalCircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown,
        });

        let mut previous = breaker.state(DOMAIN);
        for op in ops {
            match op {
                Op::Check => {
                    let _ = breaker.check(DOMAIN);
                }
                Op::Success => breaker.record_success(DOMAIN),
                Op::Failure => {
                    let _ = breaker.record_failure(DOMAIN);
                }
                Op::WaitCooldown => {
                    std::thread::sleep(cooldown + Duration::from_millis(5));
                    // The Open -> HalfOpen edge is taken on the next check
                    let _ = breaker.check(DOMAIN);
                }
            }
            let current = breaker.state(DOMAIN);
            prop_assert!(
                legal_edge(previous, current),
                "illegal edge {previous:?} -> {current:?} after {op:?}"
            );
            previous = current;
        }
    }

    /// An open circuit rejects every call until the cooldown elapses
    #[test]
    fn open_circuit_fails_fast(extra_failures in 0u32..5) {
        const DOMAIN: &str = "example.com";
        let breaker = LocalCircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(3600),
        });

        for _ in 0..(2 + extra_failures) {
            let _ = breaker.record_failure(DOMAIN);
        }
        prop_assert_eq!(breaker.state(DOMAIN), CircuitState::Open);

        for _ in 0..5 {
            prop_assert!(breaker.check(DOMAIN).is_err());
        }
    }
}
