//! Per (rule, group) evaluation state

use crate::models::Labels;
use chrono::{DateTime, Utc};

/// Phase of the `Inactive -> Pending -> Firing` state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Inactive,
    Pending { since: DateTime<Utc> },
    Firing { since: DateTime<Utc> },
}

impl GroupPhase {
    pub fn is_active(&self) -> bool {
        !matches!(self, GroupPhase::Inactive)
    }
}

/// Outcome of combining a group's conditions for one cycle
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    True,
    False,
    Inconclusive(String),
}

/// What the state machine asks the evaluator to emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    None,
    EnteredPending,
    Firing,
    Cleared,
}

#[derive(Debug, Clone)]
pub struct GroupState {
    pub labels: Labels,
    pub phase: GroupPhase,
    /// Last cycle in which the group had at least one fresh series
    pub last_seen: DateTime<Utc>,
}

impl GroupState {
    pub fn new(labels: Labels, now: DateTime<Utc>) -> Self {
        Self {
            labels,
            phase: GroupPhase::Inactive,
            last_seen: now,
        }
    }

    /// Advance the state machine by one cycle
    pub(crate) fn advance(
        &mut self,
        verdict: &Verdict,
        for_duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Step {
        self.last_seen = now;
        match (verdict, self.phase) {
            (Verdict::Inconclusive(_), _) => Step::None,

            (Verdict::False, GroupPhase::Inactive) => Step::None,
            (Verdict::False, _) => {
                self.phase = GroupPhase::Inactive;
                Step::Cleared
            }

            (Verdict::True, GroupPhase::Inactive) => {
                if for_duration <= chrono::Duration::zero() {
                    self.phase = GroupPhase::Firing { since: now };
                    Step::Firing
                } else {
                    self.phase = GroupPhase::Pending { since: now };
                    Step::EnteredPending
                }
            }
            (Verdict::True, GroupPhase::Pending { since }) => {
                if now - since >= for_duration {
                    self.phase = GroupPhase::Firing { since: now };
                    Step::Firing
                } else {
                    Step::None
                }
            }
            (Verdict::True, GroupPhase::Firing { .. }) => Step::Firing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + mins * 60, 0).unwrap()
    }

    #[test]
    fn test_pending_then_firing_after_for_duration() {
        let mut state = GroupState::new(Labels::new(), t(0));
        let five = chrono::Duration::minutes(5);

        assert_eq!(state.advance(&Verdict::True, five, t(0)), Step::EnteredPending);
        assert_eq!(state.advance(&Verdict::True, five, t(4)), Step::None);
        assert_eq!(state.advance(&Verdict::True, five, t(5)), Step::Firing);
        assert_eq!(state.phase, GroupPhase::Firing { since: t(5) });
        assert_eq!(state.advance(&Verdict::True, five, t(6)), Step::Firing);
    }

    #[test]
    fn test_inconclusive_keeps_phase() {
        let mut state = GroupState::new(Labels::new(), t(0));
        let five = chrono::Duration::minutes(5);
        state.advance(&Verdict::True, five, t(0));

        let verdict = Verdict::Inconclusive("insufficient data".into());
        assert_eq!(state.advance(&verdict, five, t(1)), Step::None);
        assert_eq!(state.phase, GroupPhase::Pending { since: t(0) });
    }

    #[test]
    fn test_false_clears_active_phase() {
        let mut state = GroupState::new(Labels::new(), t(0));
        let zero = chrono::Duration::zero();

        assert_eq!(state.advance(&Verdict::True, zero, t(0)), Step::Firing);
        assert_eq!(state.advance(&Verdict::False, zero, t(1)), Step::Cleared);
        assert_eq!(state.advance(&Verdict::False, zero, t(2)), Step::None);
        assert!(!state.phase.is_active());
    }
}
