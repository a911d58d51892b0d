//! Reaction toggle state machine.
//!
//! Storage applies a [`ReactionTransition`] inside the same transaction that
//! reads the existing (post, user) row, so the row change and the counter
//! deltas always commit together.

use crate::models::{ReactionSummary, ReactionType};

/// What the acting user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionRequest {
    Toggle(ReactionType),
    Remove,
}

impl ReactionRequest {
    pub fn transition(self, existing: Option<ReactionType>) -> ReactionTransition {
        match self {
            Self::Toggle(kind) => ReactionTransition::toggle(existing, kind),
            Self::Remove => ReactionTransition::remove(existing),
        }
    }
}

/// Committed result of a reaction mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionOutcome {
    pub summary: ReactionSummary,
    pub transition: ReactionTransition,
}

/// How the single (post, user) reaction row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    None,
    Insert(ReactionType),
    Update(ReactionType),
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionTransition {
    pub previous: Option<ReactionType>,
    pub next: Option<ReactionType>,
}

impl ReactionTransition {
    /// React with `requested`. Same type twice toggles it off, the opposite
    /// type replaces it.
    pub fn toggle(existing: Option<ReactionType>, requested: ReactionType) -> Self {
        let next = match existing {
            Some(current) if current == requested => None,
            _ => Some(requested),
        };
        Self { previous: existing, next }
    }

    /// Unconditional removal; a no-op when nothing exists.
    pub fn remove(existing: Option<ReactionType>) -> Self {
        Self { previous: existing, next: None }
    }

    pub fn row_change(&self) -> RowChange {
        match (self.previous, self.next) {
            (None, None) => RowChange::None,
            (None, Some(kind)) => RowChange::Insert(kind),
            (Some(_), None) => RowChange::Delete,
            (Some(old), Some(new)) if old == new => RowChange::None,
            (Some(_), Some(new)) => RowChange::Update(new),
        }
    }

    pub fn upvote_delta(&self) -> i64 {
        self.delta_for(ReactionType::Upvote)
    }

    pub fn downvote_delta(&self) -> i64 {
        self.delta_for(ReactionType::Downvote)
    }

    /// True when the user ends up with a reaction they did not have before.
    pub fn is_newly_set(&self) -> bool {
        self.next.is_some() && self.next != self.previous
    }

    fn delta_for(&self, kind: ReactionType) -> i64 {
        let had = i64::from(self.previous == Some(kind));
        let has = i64::from(self.next == Some(kind));
        has - had
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ReactionType::{Downvote, Upvote};

    #[test]
    fn test_first_reaction_inserts() {
        let t = ReactionTransition::toggle(None, Upvote);
        assert_eq!(t.row_change(), RowChange::Insert(Upvote));
        assert_eq!((t.upvote_delta(), t.downvote_delta()), (1, 0));
        assert!(t.is_newly_set());
    }

    #[test]
    fn test_same_type_toggles_off() {
        let t = ReactionTransition::toggle(Some(Upvote), Upvote);
        assert_eq!(t.next, None);
        assert_eq!(t.row_change(), RowChange::Delete);
        assert_eq!((t.upvote_delta(), t.downvote_delta()), (-1, 0));
        assert!(!t.is_newly_set());
    }

    #[test]
    fn test_opposite_type_swaps_counters() {
        let t = ReactionTransition::toggle(Some(Upvote), Downvote);
        assert_eq!(t.row_change(), RowChange::Update(Downvote));
        assert_eq!((t.upvote_delta(), t.downvote_delta()), (-1, 1));
        assert!(t.is_newly_set());
    }

    #[test]
    fn test_remove_without_reaction_is_noop() {
        let t = ReactionTransition::remove(None);
        assert_eq!(t.row_change(), RowChange::None);
        assert_eq!((t.upvote_delta(), t.downvote_delta()), (0, 0));
    }

    #[derive(Debug, Clone, Copy)]
    enum Action {
        React(ReactionType),
        Remove,
    }

    fn arb_action() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::React(Upvote)),
            Just(Action::React(Downvote)),
            Just(Action::Remove),
        ]
    }

    proptest! {
        #[test]
        fn counters_track_the_single_row(actions in proptest::collection::vec(arb_action(), 0..40)) {
            let mut row: Option<ReactionType> = None;
            let (mut up, mut down) = (0i64, 0i64);

            for action in actions {
                let t = match action {
                    Action::React(kind) => ReactionTransition::toggle(row, kind),
                    Action::Remove => ReactionTransition::remove(row),
                };
                row = match t.row_change() {
                    RowChange::None => row,
                    RowChange::Insert(k) | RowChange::Update(k) => Some(k),
                    RowChange::Delete => None,
                };
                up += t.upvote_delta();
                down += t.downvote_delta();

                prop_assert_eq!(row, t.next);
                prop_assert_eq!(up, i64::from(row == Some(Upvote)));
                prop_assert_eq!(down, i64::from(row == Some(Downvote)));
            }
        }

        #[test]
        fn double_react_returns_to_baseline(kind in prop_oneof![Just(Upvote), Just(Downvote)]) {
            let first = ReactionTransition::toggle(None, kind);
            let second = ReactionTransition::toggle(first.next, kind);
            prop_assert_eq!(second.next, None);
            prop_assert_eq!(first.upvote_delta() + second.upvote_delta(), 0);
            prop_assert_eq!(first.downvote_delta() + second.downvote_delta(), 0);
        }
    }
}
