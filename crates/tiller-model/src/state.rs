// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of the single model slot owned by the state coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    NotLoaded,
    Loading,
    Loaded,
    Generating,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeTransition {
    Load,
    CompleteLoad,
    FailLoad,
    StartGeneration,
    StopGeneration,
    Unload,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid runtime state transition {transition:?} from {from:?}")]
pub struct TransitionError {
    pub from: RuntimeState,
    pub transition: RuntimeTransition,
}

impl RuntimeState {
    /// Apply one transition.  Invalid combinations reject without changing
    /// anything — the caller still holds the original state by value.
    pub fn apply(self, transition: RuntimeTransition) -> Result<RuntimeState, TransitionError> {
        use RuntimeState::*;
        use RuntimeTransition::*;
        let next = match (self, transition) {
            (_, Reset) => NotLoaded,
            (NotLoaded, Load) => Loading,
            (Loading, CompleteLoad) => Loaded,
            (Loading, FailLoad) => Error,
            (Loading, Unload) => NotLoaded,
            (Loaded, StartGeneration) => Generating,
            (Loaded, Unload) => NotLoaded,
            (Generating, StopGeneration) => Loaded,
            (Generating, Unload) => NotLoaded,
            (Error, Load) => Loading,
            (from, transition) => return Err(TransitionError { from, transition }),
        };
        Ok(next)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::RuntimeState::*;
    use super::RuntimeTransition::*;
    use super::*;

    #[test]
    fn happy_path_load_generate_unload() {
        let s = NotLoaded;
        let s = s.apply(Load).unwrap();
        assert_eq!(s, Loading);
        let s = s.apply(CompleteLoad).unwrap();
        assert_eq!(s, Loaded);
        let s = s.apply(StartGeneration).unwrap();
        assert_eq!(s, Generating);
        let s = s.apply(StopGeneration).unwrap();
        assert_eq!(s, Loaded);
        let s = s.apply(Unload).unwrap();
        assert_eq!(s, NotLoaded);
    }

    #[test]
    fn failed_load_lands_in_error_and_can_retry() {
        let s = NotLoaded.apply(Load).unwrap().apply(FailLoad).unwrap();
        assert_eq!(s, Error);
        assert_eq!(s.apply(Load).unwrap(), Loading);
    }

    #[test]
    fn reset_is_accepted_from_every_state() {
        for s in [NotLoaded, Loading, Loaded, Generating, Error] {
            assert_eq!(s.apply(Reset).unwrap(), NotLoaded);
        }
    }

    #[test]
    fn invalid_transitions_reject_without_side_effects() {
        let cases = [
            (NotLoaded, CompleteLoad),
            (NotLoaded, StartGeneration),
            (NotLoaded, Unload),
            (Loaded, Load),
            (Loaded, CompleteLoad),
            (Loaded, StopGeneration),
            (Generating, Load),
            (Generating, StartGeneration),
            (Error, Unload),
            (Error, StartGeneration),
        ];
        for (from, t) in cases {
            let err = from.apply(t).unwrap_err();
            assert_eq!(err.from, from);
            assert_eq!(err.transition, t);
        }
    }

    /// Exhaustive check that `apply` agrees with the transition table: every
    /// (state, transition) pair either lands on the table's target or rejects.
    #[test]
    fn accepted_pairs_match_table_exactly() {
        let all_states = [NotLoaded, Loading, Loaded, Generating, Error];
        let all_transitions = [
            Load,
            CompleteLoad,
            FailLoad,
            StartGeneration,
            StopGeneration,
            Unload,
            Reset,
        ];
        let mut accepted = 0;
        for s in all_states {
            for t in all_transitions {
                if s.apply(t).is_ok() {
                    accepted += 1;
                }
            }
        }
        // 5 Reset rows + Load×2 + CompleteLoad + FailLoad + StartGeneration
        // + StopGeneration + Unload×3
        assert_eq!(accepted, 5 + 2 + 1 + 1 + 1 + 1 + 3);
    }
}
