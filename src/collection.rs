//! Collections that can be awaited as a unit.
//!
//! A [Collection] owns a list of elements and is at the same time a deferred
//! over "every operation requested against these elements has completed".
//! Work is requested with [Collection::run], which starts one operation per
//! element; the collection's own future facet fulfils with the elements once
//! all of that work has fulfilled, or rejects with the first failure.
//!
//! ```
//! use pledge::collection::Collection;
//! use pledge::deferred::{Deferred, State};
//! use pledge::task::Executor;
//!
//! let panels = Collection::<&str, String>::new(["header", "body", "footer"]);
//! panels.run(|name| Deferred::resolved(name.len()));
//!
//! let loaded = panels.then(|items| Ok(items.len()));
//! Executor::run();
//!
//! assert_eq!(loaded.state(), State::Fulfilled(3));
//! assert_eq!(panels[1], "body");
//! ```
use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug},
    ops::Deref,
    rc::Rc,
};

use log::debug;

use crate::deferred::{Deferred, Rejection, RejectionSink, Resolver, Settlement};

struct Tracker<T, E> {
    items: Rc<[T]>,
    resolver: Resolver<Rc<[T]>, E>,
    outstanding: Cell<usize>,
    awaited: Cell<bool>,
    failure: RefCell<Option<Rejection<E>>>,
}

impl<T, E> Tracker<T, E>
where
    T: 'static,
    E: Clone + Debug + 'static,
{
    fn fail(&self, reason: Rejection<E>) {
        let mut failure = self.failure.borrow_mut();

        if failure.is_none() && !self.resolver.is_settled() {
            *failure = Some(reason);
        }
    }

    /// Settle the facet once someone waits on it: with the first failure, or
    /// with the items when no work is left.
    fn complete_if_idle(&self) {
        if !self.awaited.get() {
            return;
        }

        let failure = self.failure.borrow_mut().take();

        match failure {
            Some(reason) => {
                self.resolver.settle(Err(reason));
            }
            None if self.outstanding.get() == 0 => {
                self.resolver.resolve(self.items.clone());
            }
            None => {}
        }
    }
}

/// A list of elements with a future facet.
///
/// See the [module-level documentation](self) for more information.
pub struct Collection<T, E> {
    items: Rc<[T]>,
    facet: Deferred<Rc<[T]>, E>,
    tracker: Rc<Tracker<T, E>>,
}

impl<T, E> Collection<T, E>
where
    T: 'static,
    E: Clone + Debug + 'static,
{
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::new_in(&RejectionSink::new(), items)
    }

    /// Like [Collection::new], reporting unhandled rejections to `sink`.
    pub fn new_in(sink: &RejectionSink, items: impl IntoIterator<Item = T>) -> Self {
        let items: Rc<[T]> = items.into_iter().collect();
        let (facet, resolver) = Deferred::pending_in(sink);

        Self {
            items: items.clone(),
            facet,
            tracker: Rc::new(Tracker {
                items,
                resolver,
                outstanding: Cell::new(0),
                awaited: Cell::new(false),
                failure: RefCell::new(None),
            }),
        }
    }

    /// Start one operation per element and track it.
    ///
    /// Operations requested after the facet has settled are started but not
    /// waited on.
    pub fn run<U>(&self, mut op: impl FnMut(&T) -> Deferred<U, E>) -> &Self
    where
        U: Clone + 'static,
    {
        if self.facet.is_settled() {
            debug!("collection already settled, new work is not awaited");
        }

        for item in self.items.iter() {
            let work = op(item);
            let tracker = self.tracker.clone();

            tracker.outstanding.set(tracker.outstanding.get() + 1);

            work.subscribe(move |outcome| {
                tracker.outstanding.set(tracker.outstanding.get() - 1);

                if let Err(reason) = outcome {
                    tracker.fail(reason);
                }

                tracker.complete_if_idle();
            });
        }

        self
    }

    /// The future facet: fulfils with the elements once every requested
    /// operation fulfilled, or rejects with the first failure.
    ///
    /// Nothing settles the facet before it has been asked for, so a failure
    /// that happens earlier is held until then.
    pub fn settled(&self) -> Deferred<Rc<[T]>, E> {
        self.tracker.awaited.set(true);
        self.tracker.complete_if_idle();

        self.facet.clone()
    }

    pub fn then<U, F, S>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(Rc<[T]>) -> S + 'static,
        S: Settlement<U, E>,
    {
        self.settled().then(on_fulfilled)
    }

    pub fn catch<F, S>(&self, on_rejected: F) -> Deferred<Rc<[T]>, E>
    where
        F: FnOnce(Rejection<E>) -> S + 'static,
        S: Settlement<Rc<[T]>, E>,
    {
        self.settled().catch(on_rejected)
    }

    pub fn then_or<U, F, R, S1, S2>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(Rc<[T]>) -> S1 + 'static,
        R: FnOnce(Rejection<E>) -> S2 + 'static,
        S1: Settlement<U, E>,
        S2: Settlement<U, E>,
    {
        self.settled().then_or(on_fulfilled, on_rejected)
    }

    /// Number of operations that have been requested but not finished.
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding.get()
    }
}

impl<T, E> Deref for Collection<T, E> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<'a, T, E> IntoIterator for &'a Collection<T, E> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Debug, E> Debug for Collection<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("items", &self.items)
            .field("outstanding", &self.tracker.outstanding.get())
            .finish()
    }
}
