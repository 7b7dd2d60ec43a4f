//! Concrete [`Constraint`] implementations.
//!
//! The trait itself lives in [`crate::types`] since `DecodeConfig` borrows
//! it; this module holds the implementations an executor or session might
//! install by default.

use std::collections::HashSet;

use crate::types::Constraint;

/// A constraint that allows every token and never signals completion.
/// Installed implicitly when no constraint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpConstraint;

impl Constraint for NoOpConstraint {
    fn disallowed_tokens(&self, _vocab_size: usize) -> HashSet<u32> {
        HashSet::new()
    }

    fn advance(&mut self, _token: u32) {}

    fn is_ended(&self) -> bool {
        false
    }
}

/// Restricts generation to a fixed set of allowed ids, ending as soon as one
/// of a configured set of terminal ids is sampled. Used by guaranteed-
/// parseable tool-call output.
#[derive(Debug, Clone)]
pub struct AllowListConstraint {
    allowed: HashSet<u32>,
    terminal: HashSet<u32>,
    ended: bool,
}

impl AllowListConstraint {
    pub fn new(allowed: HashSet<u32>, terminal: HashSet<u32>) -> Self {
        Self {
            allowed,
            terminal,
            ended: false,
        }
    }
}

impl Constraint for AllowListConstraint {
    fn disallowed_tokens(&self, vocab_size: usize) -> HashSet<u32> {
        (0..vocab_size as u32)
            .filter(|id| !self.allowed.contains(id))
            .collect()
    }

    fn advance(&mut self, token: u32) {
        if self.terminal.contains(&token) {
            self.ended = true;
        }
    }

    fn is_ended(&self) -> bool {
        self.ended
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allow_list_disallows_everything_outside_the_set() {
        let constraint = AllowListConstraint::new([1, 2, 3].into_iter().collect(), HashSet::new());
        let disallowed = constraint.disallowed_tokens(5);
        assert!(!disallowed.contains(&1));
        assert!(disallowed.contains(&0));
        assert!(disallowed.contains(&4));
    }

    #[test]
    fn allow_list_ends_on_terminal_token() {
        let mut constraint = AllowListConstraint::new([1, 2].into_iter().collect(), [2].into_iter().collect());
        assert!(!constraint.is_ended());
        constraint.advance(1);
        assert!(!constraint.is_ended());
        constraint.advance(2);
        assert!(constraint.is_ended());
    }
}
