//! Deferreds: single-settlement values with a chaining algebra.
//!
//! A [Deferred] represents the eventual result of an asynchronous operation.
//! It starts out pending and settles exactly once, either fulfilled with a
//! value or rejected with a [Rejection]. The only way to settle it is through
//! the [Resolver] created alongside it, which is handed to the producer and
//! never to consumers.
//!
//! Consumers register *reactions* with [Deferred::then], [Deferred::catch] and
//! [Deferred::then_or]. Each call returns a new deferred that settles with the
//! outcome of whichever handler ran. Handlers return a [Settlement]: either a
//! `Result` (an `Err` rejects the derived deferred with
//! [Rejection::Handler]), or another deferred whose eventual outcome the
//! derived deferred adopts.
//!
//! Reactions never run inside the call that registers them, nor inside the
//! call that settles the deferred. They are queued on the thread's
//! [Executor](crate::task::Executor) and run in registration order on a later
//! turn.
//!
//! # Example
//!
//! ```
//! use pledge::deferred::Deferred;
//! use pledge::task::Executor;
//!
//! let (input, resolver) = Deferred::<u32, String>::pending();
//!
//! let output = input
//!     .then(|v| Ok(v + 1))
//!     .then(|v| {
//!         // Returning a deferred flattens it into the chain.
//!         Deferred::resolved(v * 2)
//!     });
//!
//! resolver.resolve(20);
//!
//! assert_eq!(Executor::block_on(async move { output.await }), Ok(42));
//! ```
use std::{
    cell::RefCell,
    fmt::{self, Debug},
    future::{Future, IntoFuture},
    pin::Pin,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};

use log::trace;

use crate::task::Executor;

pub mod rejection;
pub mod state;

pub use rejection::{Rejection, RejectionSink, UnhandledRejection};
pub use state::{Outcome, State};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Reaction<T, E> = Box<dyn FnOnce(Outcome<T, E>)>;

struct Inner<T, E> {
    id: u64,
    state: State<T, E>,
    reactions: Vec<Reaction<T, E>>,
    observed: bool,
    sink: RejectionSink,
}

/// A handle to a single-settlement asynchronous value.
///
/// See the [module-level documentation](self) for more information. Cloning a
/// deferred yields another handle to the same underlying value.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

/// The producer-only capability that settles a [Deferred].
///
/// The first call to [Resolver::resolve] or [Resolver::reject] settles the
/// deferred; every later call has no effect.
pub struct Resolver<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

/// What a handler hands back to the chain.
///
/// This is produced by [Settlement::into_next] and is rarely named directly.
pub enum Next<U, E> {
    /// Settle the derived deferred right away.
    Settle(Outcome<U, E>),
    /// Settle the derived deferred like this one, once it settles.
    Adopt(Deferred<U, E>),
}

/// Values a `then`/`catch` handler may return.
pub trait Settlement<U, E> {
    fn into_next(self) -> Next<U, E>;
}

impl<U, E> Settlement<U, E> for Result<U, E> {
    fn into_next(self) -> Next<U, E> {
        Next::Settle(self.map_err(Rejection::Handler))
    }
}

impl<U, E> Settlement<U, E> for Deferred<U, E> {
    fn into_next(self) -> Next<U, E> {
        Next::Adopt(self)
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Create a new deferred and call `executor` with its resolver before
    /// returning.
    ///
    /// Unhandled rejections of this deferred and of everything derived from
    /// it are reported to a private sink, which only logs them. Use
    /// [Deferred::new_in] to collect them.
    pub fn new(executor: impl FnOnce(Resolver<T, E>)) -> Self {
        Self::new_in(&RejectionSink::new(), executor)
    }

    /// Like [Deferred::new], reporting unhandled rejections to `sink`.
    pub fn new_in(sink: &RejectionSink, executor: impl FnOnce(Resolver<T, E>)) -> Self {
        let (deferred, resolver) = Self::pending_in(sink);

        executor(resolver);

        deferred
    }

    /// Create a pending deferred together with its resolver.
    pub fn pending() -> (Self, Resolver<T, E>) {
        Self::pending_in(&RejectionSink::new())
    }

    pub fn pending_in(sink: &RejectionSink) -> (Self, Resolver<T, E>) {
        let inner = Rc::new(RefCell::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: State::Pending,
            reactions: Vec::new(),
            observed: false,
            sink: sink.clone(),
        }));

        (
            Self {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    /// An already fulfilled deferred.
    pub fn resolved(value: T) -> Self {
        Self::new(|r| {
            r.resolve(value);
        })
    }

    /// An already rejected deferred.
    pub fn rejected(reason: Rejection<E>) -> Self {
        Self::new(|r| {
            r.settle(Err(reason));
        })
    }

    /// Register handlers for both outcomes.
    ///
    /// Exactly one of the two handlers runs, on a later turn, once this
    /// deferred settles. The returned deferred settles with what that handler
    /// returns.
    pub fn then_or<U, F, R, S1, S2>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> S1 + 'static,
        R: FnOnce(Rejection<E>) -> S2 + 'static,
        S1: Settlement<U, E>,
        S2: Settlement<U, E>,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).into_next(),
            Err(reason) => on_rejected(reason).into_next(),
        })
    }

    /// Register a fulfillment handler. A rejection passes through unchanged.
    pub fn then<U, F, S>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> S + 'static,
        S: Settlement<U, E>,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).into_next(),
            Err(reason) => Next::Settle(Err(reason)),
        })
    }

    /// Register a rejection handler. A fulfillment passes through unchanged.
    ///
    /// An `Ok` returned from the handler puts the chain back on the fulfilled
    /// track.
    pub fn catch<F, S>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(Rejection<E>) -> S + 'static,
        S: Settlement<T, E>,
    {
        self.chain(move |outcome| match outcome {
            Ok(value) => Next::Settle(Ok(value)),
            Err(reason) => on_rejected(reason).into_next(),
        })
    }

    /// Run `f` once this deferred settles, whatever the outcome, and pass the
    /// outcome on.
    pub fn finally(&self, f: impl FnOnce() + 'static) -> Deferred<T, E> {
        self.chain(move |outcome| {
            f();
            Next::Settle(outcome)
        })
    }

    fn chain<U>(&self, handler: impl FnOnce(Outcome<T, E>) -> Next<U, E> + 'static) -> Deferred<U, E>
    where
        U: Clone + 'static,
    {
        let (derived, resolver) = Deferred::pending_in(&self.inner.borrow().sink);

        self.subscribe(move |outcome| resolver.follow(handler(outcome)));

        derived
    }

    /// Queue `reaction` to run once with the outcome of this deferred.
    pub(crate) fn subscribe(&self, reaction: impl FnOnce(Outcome<T, E>) + 'static) {
        self.react(reaction, true);
    }

    /// Like [Deferred::subscribe], without counting as observing a rejection.
    pub(crate) fn on_settled(&self, reaction: impl FnOnce(Outcome<T, E>) + 'static) {
        self.react(reaction, false);
    }

    fn react(&self, reaction: impl FnOnce(Outcome<T, E>) + 'static, observe: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.observed |= observe;

        match inner.state.outcome() {
            None => inner.reactions.push(Box::new(reaction)),
            Some(outcome) => {
                drop(inner);
                Executor::defer(move || reaction(outcome));
            }
        }
    }

    /// Identifier used in unhandled rejection reports.
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// A copy of the current state.
    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().state.is_settled()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inner.borrow().state.is_fulfilled()
    }

    pub fn is_rejected(&self) -> bool {
        self.inner.borrow().state.is_rejected()
    }

    /// The sink unhandled rejections of this chain are reported to.
    pub fn sink(&self) -> RejectionSink {
        self.inner.borrow().sink.clone()
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Fulfil the deferred with `value`. Returns `false` if it had already
    /// settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject the deferred with [Rejection::Failed]. Returns `false` if it
    /// had already settled.
    pub fn reject(&self, reason: E) -> bool {
        self.settle(Err(Rejection::Failed(reason)))
    }

    /// Settle the deferred with an arbitrary outcome.
    pub fn settle(&self, outcome: Outcome<T, E>) -> bool {
        let mut inner = self.inner.borrow_mut();

        if !inner.state.settle(outcome.clone()) {
            trace!("deferred #{} already settled, ignoring", inner.id);
            return false;
        }

        let reactions = std::mem::take(&mut inner.reactions);
        let unobserved = outcome.is_err() && !inner.observed;

        trace!(
            "deferred #{} settled, {} reaction(s) queued",
            inner.id,
            reactions.len()
        );

        drop(inner);

        for reaction in reactions {
            let outcome = outcome.clone();
            Executor::defer(move || reaction(outcome));
        }

        if unobserved {
            let inner = self.inner.clone();
            Executor::after_jobs(move || {
                let (sink, report) = {
                    let inner = inner.borrow();

                    match &inner.state {
                        State::Rejected(reason) if !inner.observed => (
                            inner.sink.clone(),
                            UnhandledRejection {
                                deferred: inner.id,
                                reason: format!("{reason:?}"),
                            },
                        ),
                        _ => return,
                    }
                };

                sink.report(report);
            });
        }

        true
    }

    /// Settle as described by a handler's return value.
    fn follow(self, next: Next<T, E>) {
        match next {
            Next::Settle(outcome) => {
                self.settle(outcome);
            }
            Next::Adopt(other) => other.subscribe(move |outcome| {
                self.settle(outcome);
            }),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().state.is_settled()
    }
}

impl<T: Debug, E: Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();

        f.debug_struct("Deferred")
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("reactions", &inner.reactions.len())
            .field("observed", &inner.observed)
            .finish()
    }
}

impl<T, E> Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("deferred", &self.inner.borrow().id)
            .finish()
    }
}

/// Future returned by `.await`ing a [Deferred].
///
/// Awaiting a deferred counts as observing its rejection.
pub struct Settled<T, E> {
    deferred: Deferred<T, E>,
    waker: Option<Rc<RefCell<Option<Waker>>>>,
}

impl<T, E> IntoFuture for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Outcome<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Settled {
            deferred: self,
            waker: None,
        }
    }
}

impl<T, E> Future for Settled<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        {
            let mut inner = this.deferred.inner.borrow_mut();
            inner.observed = true;

            if let Some(outcome) = inner.state.outcome() {
                return Poll::Ready(outcome);
            }
        }

        match &this.waker {
            Some(slot) => *slot.borrow_mut() = Some(cx.waker().clone()),
            None => {
                let slot = Rc::new(RefCell::new(Some(cx.waker().clone())));
                let wake = slot.clone();

                this.deferred.subscribe(move |_| {
                    if let Some(waker) = wake.borrow_mut().take() {
                        waker.wake();
                    }
                });

                this.waker = Some(slot);
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, future::IntoFuture, rc::Rc};

    use super::{Deferred, Rejection, RejectionSink, State};
    use crate::task::Executor;

    fn log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn executor_runs_synchronously() {
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();

        let d = Deferred::<u8, ()>::new(move |r| {
            *ran2.borrow_mut() = true;
            r.resolve(7);
        });

        assert!(*ran.borrow());
        assert_eq!(d.state(), State::Fulfilled(7));
    }

    #[test]
    fn settle_once() {
        let (d, r) = Deferred::<u8, &str>::pending();

        assert!(r.resolve(1));
        assert!(!r.resolve(2));
        assert!(!r.reject("late"));
        assert!(!r.settle(Err(Rejection::Aborted)));

        assert_eq!(d.state(), State::Fulfilled(1));

        let (d, r) = Deferred::<u8, &str>::pending();
        let _ = d.catch(|_| Ok(0));

        assert!(r.reject("first"));
        assert!(!r.resolve(9));
        assert_eq!(d.state(), State::Rejected(Rejection::Failed("first")));

        Executor::run();
    }

    #[test]
    fn reactions_fire_in_order_after_settlement() {
        let events = log();
        let (d, r) = Deferred::<u8, ()>::pending();

        for n in 0..5 {
            let events = events.clone();
            d.then(move |v| {
                events.borrow_mut().push(format!("{n}:{v}"));
                Ok(())
            });
        }

        Executor::run();
        assert!(events.borrow().is_empty());

        r.resolve(3);
        assert!(events.borrow().is_empty(), "reactions ran synchronously");

        Executor::run();
        assert_eq!(*events.borrow(), vec!["0:3", "1:3", "2:3", "3:3", "4:3"]);
    }

    #[test]
    fn late_registration_fires_once_on_next_turn() {
        let events = log();
        let d = Deferred::<&str, ()>::resolved("done");

        {
            let events = events.clone();
            d.then(move |v| {
                events.borrow_mut().push(v.to_string());
                Ok(())
            });
        }

        assert!(events.borrow().is_empty());

        Executor::run();
        Executor::run();

        assert_eq!(*events.borrow(), vec!["done"]);
    }

    #[test]
    fn chaining_identity() {
        let d = Deferred::<(), ()>::resolved(());
        let same = d.then(Ok);

        Executor::run();
        assert_eq!(same.state(), State::Fulfilled(()));

        let d = Deferred::<Option<u8>, ()>::resolved(None);
        let same = d.then(Ok);

        Executor::run();
        assert_eq!(same.state(), State::Fulfilled(None));
    }

    #[test]
    fn handler_failure_rejects_derived() {
        let d = Deferred::<u8, String>::resolved(1);
        let failed = d.then(|_| Err::<u8, _>("bad input".to_string()));
        let recovered = failed.catch(|r| {
            assert_eq!(r, Rejection::Handler("bad input".to_string()));
            Ok(10)
        });

        Executor::run();

        assert_eq!(
            failed.state(),
            State::Rejected(Rejection::Handler("bad input".into()))
        );
        assert_eq!(recovered.state(), State::Fulfilled(10));
    }

    #[test]
    fn rejection_passes_through_then() {
        let seen = log();
        let d = Deferred::<u8, &str>::rejected(Rejection::Failed("io"));

        let end = {
            let seen = seen.clone();
            d.then(|v| Ok(v + 1))
                .then(|v| Ok(v * 2))
                .catch(move |r| {
                    seen.borrow_mut().push(format!("{r}"));
                    Ok(0)
                })
        };

        Executor::run();

        assert_eq!(*seen.borrow(), vec!["operation failed: \"io\""]);
        assert_eq!(end.state(), State::Fulfilled(0));
    }

    #[test]
    fn fulfillment_passes_through_catch() {
        let d = Deferred::<u8, ()>::resolved(5);
        let c = d.catch(|_| Ok(0));

        Executor::run();
        assert_eq!(c.state(), State::Fulfilled(5));
    }

    #[test]
    fn then_or_picks_one_handler() {
        let d = Deferred::<u8, u8>::rejected(Rejection::Failed(4));
        let out = d.then_or(|v| Ok::<_, u8>(v.to_string()), |r| Ok(format!("{r:?}")));

        Executor::run();
        assert_eq!(out.state(), State::Fulfilled("Failed(4)".to_string()));
    }

    #[test]
    fn flattening_adopts_later_outcome() {
        let (inner, inner_r) = Deferred::<u8, &str>::pending();
        let outer = Deferred::<(), &str>::resolved(());

        let adopted = {
            let inner = inner.clone();
            outer.then(move |()| inner)
        };

        Executor::run();
        assert!(adopted.is_pending());

        inner_r.resolve(11);
        Executor::run();
        assert_eq!(adopted.state(), State::Fulfilled(11));

        let (inner, inner_r) = Deferred::<u8, &str>::pending();
        let adopted = {
            let inner = inner.clone();
            outer.then(move |()| inner)
        };

        inner_r.reject("nope");
        Executor::run();
        assert_eq!(
            adopted.state(),
            State::Rejected(Rejection::Failed("nope"))
        );
    }

    #[test]
    fn finally_runs_on_both_tracks() {
        let hits = Rc::new(RefCell::new(0));

        let ok = {
            let hits = hits.clone();
            Deferred::<u8, ()>::resolved(1).finally(move || *hits.borrow_mut() += 1)
        };
        let err = {
            let hits = hits.clone();
            Deferred::<u8, ()>::rejected(Rejection::Aborted).finally(move || *hits.borrow_mut() += 1)
        };
        let handled = err.catch(|r| Ok(if r.is_aborted() { 2 } else { 0 }));

        Executor::run();

        assert_eq!(*hits.borrow(), 2);
        assert_eq!(ok.state(), State::Fulfilled(1));
        assert_eq!(handled.state(), State::Fulfilled(2));
    }

    #[test]
    fn unhandled_rejection_reported_once() {
        let sink = RejectionSink::new();
        let (d, r) = Deferred::<u8, &str>::pending_in(&sink);

        let tail = d.then(|v| Ok(v + 1)).then(|v| Ok(v + 1));

        r.reject("boom");
        Executor::run();

        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, "Failed(\"boom\")");
        assert_eq!(reports[0].deferred, tail.id());

        Executor::run();
        assert!(sink.is_empty());
    }

    #[test]
    fn unobserved_root_rejection_is_reported() {
        let sink = RejectionSink::new();
        let d = Deferred::<(), ()>::new_in(&sink, |r| {
            r.settle(Err(Rejection::Aborted));
        });

        Executor::run();

        assert_eq!(sink.reports()[0].deferred, d.id());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn handled_rejection_is_not_reported() {
        let sink = RejectionSink::new();
        let (d, r) = Deferred::<u8, &str>::pending_in(&sink);

        let _ = d.then(|v| Ok(v)).catch(|_| Ok(0));

        r.reject("boom");
        Executor::run();

        assert!(sink.is_empty());
    }

    #[test]
    fn registration_before_drain_counts_as_handled() {
        let sink = RejectionSink::new();
        let (d, r) = Deferred::<u8, &str>::pending_in(&sink);

        r.reject("boom");
        let _ = d.catch(|_| Ok(1));

        Executor::run();
        assert!(sink.is_empty());
    }

    #[test]
    fn await_yields_outcome() {
        let (d, r) = Deferred::<u8, &str>::pending();

        let v = Executor::block_on(async move {
            Executor::defer(move || {
                r.resolve(4);
            });
            d.await
        });

        assert_eq!(v, Ok(4));

        let d = Deferred::<u8, &str>::rejected(Rejection::Failed("x"));
        let v = Executor::block_on(d.into_future());

        assert_eq!(v, Err(Rejection::Failed("x")));
    }

    #[test]
    fn awaiting_a_rejected_deferred_handles_it() {
        let sink = RejectionSink::new();
        let d = Deferred::<u8, &str>::new_in(&sink, |r| {
            r.reject("boom");
        });

        let v = Executor::block_on(async move { d.await });

        assert_eq!(v, Err(Rejection::Failed("boom")));
        assert!(sink.is_empty());

        let (d, r) = Deferred::<u8, &str>::pending_in(&sink);
        let waiter = Executor::spawn(async move { d.await });

        r.reject("later");

        assert_eq!(waiter.join(), Some(Err(Rejection::Failed("later"))));
        assert!(sink.is_empty());
    }

    #[test]
    fn settle_watchers_do_not_handle_rejections() {
        let sink = RejectionSink::new();
        let (d, r) = Deferred::<u8, &str>::pending_in(&sink);
        let seen = Rc::new(RefCell::new(None));

        {
            let seen = seen.clone();
            d.on_settled(move |outcome| *seen.borrow_mut() = Some(outcome));
        }

        r.reject("boom");
        Executor::run();

        assert_eq!(*seen.borrow(), Some(Err(Rejection::Failed("boom"))));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn debug_shows_observation() {
        let d = Deferred::<u8, ()>::resolved(1);
        assert!(format!("{d:?}").contains("observed: false"));

        let _ = d.then(Ok);
        assert!(format!("{d:?}").contains("observed: true"));

        Executor::run();
    }
}
