//! Balancing policies: pure functions of the candidate list (plus per-policy
//! cursor/rng state), selected once at startup via configuration.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// How the dispatcher picks one skald among the eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchPolicy {
    /// Fewest running-plus-just-assigned tasks; ties break on skald id.
    LeastTasks,
    /// Rotating cursor, persisted across ticks.
    RoundRobin,
    /// Uniform choice, seeded per tick.
    Random,
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LeastTasks => "least_tasks",
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
        };
        f.write_str(s)
    }
}

impl FromStr for DispatchPolicy {
    type Err = DispatchPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "least_tasks" => Ok(Self::LeastTasks),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(DispatchPolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DispatchPolicy`] string.
#[derive(Debug, Clone)]
pub struct DispatchPolicyParseError(pub String);

impl fmt::Display for DispatchPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dispatch policy: {:?}", self.0)
    }
}

impl std::error::Error for DispatchPolicyParseError {}

/// One eligible skald as the policy sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// `|current_tasks|` plus assignments already made this tick.
    pub load: usize,
}

/// Mutable per-dispatcher policy state: the round-robin cursor survives
/// across ticks, the rng is reseeded at the top of each tick.
pub struct PolicyState {
    cursor: usize,
    rng: StdRng,
}

impl PolicyState {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Reseed the tick-scoped rng (RANDOM policy only).
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

impl Default for PolicyState {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchPolicy {
    /// Pick the index of the chosen candidate, or `None` when the list is
    /// empty. Candidates must be sorted by id so that round-robin rotation
    /// and least-tasks tie-breaks are deterministic.
    pub fn choose(self, state: &mut PolicyState, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::LeastTasks => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
                .map(|(i, _)| i),
            Self::RoundRobin => {
                let idx = state.cursor % candidates.len();
                state.cursor = state.cursor.wrapping_add(1);
                Some(idx)
            }
            Self::Random => Some(state.rng.random_range(0..candidates.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, load: usize) -> Candidate {
        Candidate {
            id: id.to_owned(),
            load,
        }
    }

    #[test]
    fn policy_parse_roundtrip() {
        for policy in [
            DispatchPolicy::LeastTasks,
            DispatchPolicy::RoundRobin,
            DispatchPolicy::Random,
        ] {
            let parsed: DispatchPolicy = policy.to_string().parse().expect("should parse");
            assert_eq!(parsed, policy);
        }
        assert!("weighted".parse::<DispatchPolicy>().is_err());
    }

    #[test]
    fn least_tasks_prefers_lowest_load() {
        let mut state = PolicyState::new();
        let candidates = vec![candidate("s1", 1), candidate("s2", 0)];
        let chosen = DispatchPolicy::LeastTasks.choose(&mut state, &candidates);
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn least_tasks_ties_break_lexicographically() {
        let mut state = PolicyState::new();
        let candidates = vec![candidate("b", 2), candidate("a", 2), candidate("c", 2)];
        let chosen = DispatchPolicy::LeastTasks.choose(&mut state, &candidates);
        assert_eq!(chosen, Some(1));
    }

    #[test]
    fn round_robin_rotates_across_calls() {
        let mut state = PolicyState::new();
        let candidates = vec![candidate("a", 0), candidate("b", 0), candidate("c", 0)];
        let picks: Vec<_> = (0..4)
            .map(|_| DispatchPolicy::RoundRobin.choose(&mut state, &candidates))
            .collect();
        assert_eq!(picks, vec![Some(0), Some(1), Some(2), Some(0)]);
    }

    #[test]
    fn round_robin_cursor_survives_shrinking_candidate_set() {
        let mut state = PolicyState::new();
        let three = vec![candidate("a", 0), candidate("b", 0), candidate("c", 0)];
        DispatchPolicy::RoundRobin.choose(&mut state, &three);
        DispatchPolicy::RoundRobin.choose(&mut state, &three);

        let one = vec![candidate("a", 0)];
        assert_eq!(DispatchPolicy::RoundRobin.choose(&mut state, &one), Some(0));
    }

    #[test]
    fn random_is_deterministic_per_seed() {
        let candidates: Vec<Candidate> =
            (0..10).map(|i| candidate(&format!("s{i}"), 0)).collect();

        let mut a = PolicyState::new();
        a.reseed(7);
        let mut b = PolicyState::new();
        b.reseed(7);

        for _ in 0..20 {
            assert_eq!(
                DispatchPolicy::Random.choose(&mut a, &candidates),
                DispatchPolicy::Random.choose(&mut b, &candidates)
            );
        }
    }

    #[test]
    fn empty_candidates_yield_none() {
        let mut state = PolicyState::new();
        for policy in [
            DispatchPolicy::LeastTasks,
            DispatchPolicy::RoundRobin,
            DispatchPolicy::Random,
        ] {
            assert_eq!(policy.choose(&mut state, &[]), None);
        }
    }
}
