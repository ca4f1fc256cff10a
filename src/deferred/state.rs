//! Settlement state of a deferred.
//!
//! [State] is the value holder every [Deferred](super::Deferred) wraps. It
//! only knows how to move from [State::Pending] to one of the two settled
//! variants, and refuses every transition after that. Telling observers about
//! the transition is the job of the deferred, not of the state.
use super::rejection::Rejection;

/// The outcome a settled deferred carries.
pub type Outcome<T, E> = Result<T, Rejection<E>>;

/// Tri-state value holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection<E>),
}

impl<T, E> Default for State<T, E> {
    fn default() -> Self {
        Self::Pending
    }
}

impl<T, E> State<T, E> {
    /// Move a pending state to the settled state described by `outcome`.
    ///
    /// Returns `true` if the transition happened. A state that has already
    /// settled is left untouched and `false` is returned.
    pub fn settle(&mut self, outcome: Outcome<T, E>) -> bool {
        if self.is_settled() {
            return false;
        }

        *self = match outcome {
            Ok(value) => Self::Fulfilled(value),
            Err(reason) => Self::Rejected(reason),
        };

        true
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// A copy of the settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome<T, E>>
    where
        T: Clone,
        E: Clone,
    {
        match self {
            Self::Pending => None,
            Self::Fulfilled(value) => Some(Ok(value.clone())),
            Self::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Rejection, State};

    #[test]
    fn starts_pending() {
        let state = State::<u8, ()>::default();

        assert!(state.is_pending());
        assert!(!state.is_settled());
        assert_eq!(state.outcome(), None);
    }

    #[test]
    fn settles_once() {
        let mut state = State::<u8, &str>::Pending;

        assert!(state.settle(Ok(1)));
        assert!(!state.settle(Ok(2)));
        assert!(!state.settle(Err(Rejection::Failed("late"))));

        assert_eq!(state, State::Fulfilled(1));
        assert!(state.is_fulfilled());
        assert!(!state.is_rejected());
    }

    #[test]
    fn rejection_is_terminal() {
        let mut state = State::<u8, &str>::Pending;

        assert!(state.settle(Err(Rejection::Aborted)));
        assert!(!state.settle(Ok(3)));

        assert!(state.is_rejected());
        assert_eq!(state.outcome(), Some(Err(Rejection::Aborted)));
    }
}
