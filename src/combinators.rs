//! Aggregating several deferreds into one.
//!
//! * [all] fulfils with every value, in input order, once all inputs fulfil,
//!   and rejects as soon as one input rejects.
//! * [race] settles like the first input to settle.
//! * [all_settled] waits for every input and reports each final state.
//!
//! When several inputs settle in the same turn, the one with the lowest index
//! decides the outcome of [all] (among rejections) and [race]. Inputs still
//! pending once the aggregate has settled are no longer waited on.
//!
//! A timeout is a race between the operation and a timer:
//!
//! ```no_run
//! use pledge::cancel::CancelToken;
//! use pledge::combinators::race;
//! use pledge::io;
//! use std::time::Duration;
//!
//! # fn slow_call() -> pledge::deferred::Deferred<u32, io::Errno> { unimplemented!() }
//! let timeout = io::sleep(&CancelToken::new(), Duration::from_millis(250))
//!     .then(|()| Err::<u32, _>(io::Errno(libc::ETIMEDOUT)));
//! let answer = race([slow_call(), timeout]);
//! ```
use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    rc::Rc,
};

use log::trace;

use crate::{
    deferred::{Deferred, Outcome, Rejection, RejectionSink, Resolver, State},
    task::Executor,
};

/// Picks the lowest-index candidate among those offered in one turn.
///
/// The first offer schedules a decision job behind every job already queued,
/// so all inputs that settled in the same turn get to make their offer before
/// the decision is taken.
struct Arbiter<O> {
    candidate: RefCell<Option<(usize, O)>>,
    decided: Cell<bool>,
    decide: Box<dyn Fn(O)>,
}

impl<O: 'static> Arbiter<O> {
    fn new(decide: impl Fn(O) + 'static) -> Rc<Self> {
        Rc::new(Self {
            candidate: RefCell::new(None),
            decided: Cell::new(false),
            decide: Box::new(decide),
        })
    }

    fn offer(self: &Rc<Self>, idx: usize, outcome: O) {
        if self.decided.get() {
            trace!("input {idx} settled after the decision, ignored");
            return;
        }

        let mut candidate = self.candidate.borrow_mut();
        let first = candidate.is_none();

        if candidate.as_ref().map_or(true, |(best, _)| idx < *best) {
            *candidate = Some((idx, outcome));
        }

        if first {
            let this = self.clone();
            Executor::defer(move || {
                this.decided.set(true);
                let candidate = this.candidate.borrow_mut().take();

                if let Some((idx, outcome)) = candidate {
                    trace!("input {idx} decides the aggregate");
                    (this.decide)(outcome);
                }
            });
        }
    }
}

fn sink_of<T, E>(inputs: &[Deferred<T, E>]) -> RejectionSink
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    inputs.first().map(Deferred::sink).unwrap_or_default()
}

/// Wait for every input to fulfil.
///
/// The result fulfils with the values in input order, or rejects with the
/// reason of the first input to reject. `all([])` fulfils with an empty
/// vector.
pub fn all<T, E, I>(futures: I) -> Deferred<Vec<T>, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator<Item = Deferred<T, E>>,
{
    let inputs: Vec<_> = futures.into_iter().collect();
    let (aggregate, resolver) = Deferred::pending_in(&sink_of(&inputs));

    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return aggregate;
    }

    let resolver = Rc::new(resolver);
    let values = Rc::new(RefCell::new(vec![None; inputs.len()]));
    let remaining = Rc::new(Cell::new(inputs.len()));

    let failure = {
        let resolver = resolver.clone();
        Arbiter::new(move |reason: Rejection<E>| {
            resolver.settle(Err(reason));
        })
    };

    for (idx, input) in inputs.iter().enumerate() {
        let resolver = resolver.clone();
        let values = values.clone();
        let remaining = remaining.clone();
        let failure = failure.clone();

        input.subscribe(move |outcome| match outcome {
            Ok(value) => {
                values.borrow_mut()[idx] = Some(value);
                remaining.set(remaining.get() - 1);

                if remaining.get() == 0 {
                    let values = values.borrow_mut().drain(..).flatten().collect();
                    resolver.resolve(values);
                }
            }
            Err(reason) => failure.offer(idx, reason),
        });
    }

    aggregate
}

/// Settle like the first input to settle.
///
/// `race([])` never settles.
pub fn race<T, E, I>(futures: I) -> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator<Item = Deferred<T, E>>,
{
    let inputs: Vec<_> = futures.into_iter().collect();
    let (winner, resolver) = Deferred::pending_in(&sink_of(&inputs));

    let first = Arbiter::new(move |outcome: Outcome<T, E>| {
        resolver.settle(outcome);
    });

    for (idx, input) in inputs.iter().enumerate() {
        let first = first.clone();
        input.subscribe(move |outcome| first.offer(idx, outcome));
    }

    winner
}

/// Wait for every input to settle and fulfil with their final states, in
/// input order. Never rejects.
pub fn all_settled<T, E, I>(futures: I) -> Deferred<Vec<State<T, E>>, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator<Item = Deferred<T, E>>,
{
    let inputs: Vec<_> = futures.into_iter().collect();
    let (aggregate, resolver) = Deferred::pending_in(&sink_of(&inputs));

    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return aggregate;
    }

    let resolver: Rc<Resolver<Vec<State<T, E>>, E>> = Rc::new(resolver);
    let states = Rc::new(RefCell::new(vec![State::Pending; inputs.len()]));
    let remaining = Rc::new(Cell::new(inputs.len()));

    for (idx, input) in inputs.iter().enumerate() {
        let resolver = resolver.clone();
        let states = states.clone();
        let remaining = remaining.clone();

        input.subscribe(move |outcome| {
            states.borrow_mut()[idx].settle(outcome);
            remaining.set(remaining.get() - 1);

            if remaining.get() == 0 {
                resolver.resolve(states.take());
            }
        });
    }

    aggregate
}
