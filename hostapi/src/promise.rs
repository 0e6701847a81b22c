//! Promise state machine.
//!
//! A promise settles at most once. [`PromiseCell`] only tracks state and the
//! reactions waiting on it; scheduling reaction jobs belongs to the caller,
//! which receives them from the settling call.

use std::cell::RefCell;

use crate::value::{HostFunction, HostObject, HostValue};

/// Final outcome of a promise.
#[derive(Clone, Debug)]
pub enum Settlement {
    Fulfilled(HostValue),
    Rejected(HostValue),
}

impl Settlement {
    pub fn value(&self) -> &HostValue {
        match self {
            Self::Fulfilled(value) | Self::Rejected(value) => value,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }
}

#[derive(Clone, Debug, Default)]
pub enum PromiseState {
    #[default]
    Pending,
    Settled(Settlement),
}

/// A continuation registered with `then`, or an adoption link to an outer
/// promise. Missing handlers pass the settlement through to `derived`.
#[derive(Clone)]
pub struct Reaction {
    pub on_fulfilled: Option<HostFunction>,
    pub on_rejected: Option<HostFunction>,
    pub derived: Option<HostObject>,
}

impl Reaction {
    /// A pass-through link: settle `derived` exactly as the source settles.
    pub fn forward(derived: HostObject) -> Self {
        Self {
            on_fulfilled: None,
            on_rejected: None,
            derived: Some(derived),
        }
    }

    pub fn handler_for(&self, settlement: &Settlement) -> Option<&HostFunction> {
        match settlement {
            Settlement::Fulfilled(_) => self.on_fulfilled.as_ref(),
            Settlement::Rejected(_) => self.on_rejected.as_ref(),
        }
    }
}

/// State and reaction list of one promise object.
#[derive(Default)]
pub struct PromiseCell {
    state: RefCell<PromiseState>,
    reactions: RefCell<Vec<Reaction>>,
}

impl PromiseCell {
    pub fn state(&self) -> PromiseState {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Pending)
    }

    pub fn settlement(&self) -> Option<Settlement> {
        match &*self.state.borrow() {
            PromiseState::Pending => None,
            PromiseState::Settled(settlement) => Some(settlement.clone()),
        }
    }

    /// Transition out of `Pending`. Returns the reactions to schedule, or
    /// `None` if the promise was already settled (the call is ignored).
    pub fn settle(&self, settlement: Settlement) -> Option<Vec<Reaction>> {
        let mut state = self.state.borrow_mut();
        if !matches!(*state, PromiseState::Pending) {
            return None;
        }
        *state = PromiseState::Settled(settlement);
        let reactions = std::mem::take(&mut *self.reactions.borrow_mut());
        tracing::trace!(reactions = reactions.len(), "promise settled");
        Some(reactions)
    }

    /// Register a reaction. If the promise is already settled the reaction is
    /// handed back with the settlement so the caller can schedule it now.
    pub fn subscribe(&self, reaction: Reaction) -> Option<(Reaction, Settlement)> {
        match self.settlement() {
            Some(settlement) => Some((reaction, settlement)),
            None => {
                self.reactions.borrow_mut().push(reaction);
                None
            }
        }
    }

    pub fn pending_reactions(&self) -> usize {
        self.reactions.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_once() {
        let cell = PromiseCell::default();
        assert!(cell.is_pending());
        assert!(cell.settle(Settlement::Fulfilled(1.into())).is_some());
        assert!(cell.settle(Settlement::Rejected(2.into())).is_none());
        let settlement = cell.settlement().unwrap();
        assert!(settlement.is_fulfilled());
        assert_eq!(settlement.value().as_number(), Some(1.0));
    }

    #[test]
    fn test_reactions_drain_on_settle() {
        let cell = PromiseCell::default();
        assert!(cell.subscribe(Reaction::forward(HostObject::promise())).is_none());
        assert!(cell.subscribe(Reaction::forward(HostObject::promise())).is_none());
        assert_eq!(cell.pending_reactions(), 2);

        let reactions = cell.settle(Settlement::Rejected("no".into())).unwrap();
        assert_eq!(reactions.len(), 2);
        assert_eq!(cell.pending_reactions(), 0);
    }

    #[test]
    fn test_subscribe_after_settle_returns_immediately() {
        let cell = PromiseCell::default();
        cell.settle(Settlement::Fulfilled(HostValue::Null));
        let (_, settlement) = cell.subscribe(Reaction::forward(HostObject::promise())).unwrap();
        assert!(settlement.value().is_null());
        assert_eq!(cell.pending_reactions(), 0);
    }
}
