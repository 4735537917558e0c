//! Deterministic fault injection for the emulator server: base latency,
//! jitter, periodic spikes, drop-every-N, close-every-N.
//!
//! Grounded in the fault/timing-profile concept from
//! `other_examples/21a959d8_cp5337-sx9__...protocol_emulator.rs`
//! (`TimingProfile`) and the `FaultPolicyConfig` shape from
//! `other_examples/774aa8fa_hadijannat-virtual-plc__...config.rs`, adapted
//! to CIPDIP's per-connection operation counter instead of a PLC scan
//! cycle.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct FaultPolicy {
    pub base_latency: Duration,
    pub jitter: Duration,
    pub spike_every_n: Option<u32>,
    pub spike_extra_latency: Duration,
    pub drop_every_n: Option<u32>,
    pub close_every_n: Option<u32>,
    pub seed: u64,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        FaultPolicy {
            base_latency: Duration::ZERO,
            jitter: Duration::ZERO,
            spike_every_n: None,
            spike_extra_latency: Duration::ZERO,
            drop_every_n: None,
            close_every_n: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    Respond,
    Drop,
    CloseConnection,
}

pub struct FaultState {
    policy: FaultPolicy,
    rng: StdRng,
    op_count: u32,
}

impl FaultState {
    pub fn new(policy: FaultPolicy) -> Self {
        FaultState {
            rng: StdRng::seed_from_u64(policy.seed),
            policy,
            op_count: 0,
        }
    }

    /// Advances the per-connection operation counter and decides what to
    /// do with this operation: respond normally (after the computed
    /// delay), drop the request silently, or close the connection.
    pub fn next_decision(&mut self) -> (FaultDecision, Duration) {
        self.op_count += 1;
        let n = self.op_count;

        if let Some(close_every) = self.policy.close_every_n {
            if close_every > 0 && n % close_every == 0 {
                return (FaultDecision::CloseConnection, Duration::ZERO);
            }
        }
        if let Some(drop_every) = self.policy.drop_every_n {
            if drop_every > 0 && n % drop_every == 0 {
                return (FaultDecision::Drop, Duration::ZERO);
            }
        }

        let mut delay = self.policy.base_latency;
        if self.policy.jitter > Duration::ZERO {
            let jitter_ns = self.rng.gen_range(0..=self.policy.jitter.as_nanos() as u64);
            delay += Duration::from_nanos(jitter_ns);
        }
        if let Some(spike_every) = self.policy.spike_every_n {
            if spike_every > 0 && n % spike_every == 0 {
                delay += self.policy.spike_extra_latency;
            }
        }
        (FaultDecision::Respond, delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_every_n_triggers_on_the_nth_operation() {
        let mut state = FaultState::new(FaultPolicy {
            drop_every_n: Some(3),
            ..Default::default()
        });
        let decisions: Vec<_> = (0..6).map(|_| state.next_decision().0).collect();
        assert_eq!(
            decisions,
            vec![
                FaultDecision::Respond,
                FaultDecision::Respond,
                FaultDecision::Drop,
                FaultDecision::Respond,
                FaultDecision::Respond,
                FaultDecision::Drop,
            ]
        );
    }

    #[test]
    fn close_takes_priority_over_drop_on_same_operation() {
        let mut state = FaultState::new(FaultPolicy {
            drop_every_n: Some(2),
            close_every_n: Some(2),
            ..Default::default()
        });
        let (decision, _) = state.next_decision();
        assert_eq!(decision, FaultDecision::Respond);
        let (decision, _) = state.next_decision();
        assert_eq!(decision, FaultDecision::CloseConnection);
    }

    #[test]
    fn same_seed_produces_same_jitter_sequence() {
        let policy = FaultPolicy {
            base_latency: Duration::from_millis(1),
            jitter: Duration::from_millis(5),
            seed: 99,
            ..Default::default()
        };
        let mut a = FaultState::new(policy);
        let mut b = FaultState::new(policy);
        for _ in 0..10 {
            assert_eq!(a.next_decision().1, b.next_decision().1);
        }
    }
}
