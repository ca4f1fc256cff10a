//! Bridging callback-style operations into deferreds.
//!
//! Plenty of asynchronous primitives report their outcome through a success
//! and a failure callback and can optionally be told to stop. [Request] wraps
//! such a primitive: it creates a [Deferred], starts the operation right away
//! with a [Completion] (the callback pair) and a [CancelToken], and settles
//! the deferred from whichever callback fires first.
//!
//! Aborting a request rejects its deferred with [Rejection::Aborted] before
//! the operation is asked to stop. Anything the operation reports afterwards
//! is discarded.
//!
//! # Example
//!
//! ```
//! use pledge::adapter::Request;
//! use pledge::cancel::CancelToken;
//! use pledge::deferred::{Rejection, State};
//! use pledge::task::Executor;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! // A toy transport: stores the callbacks and fires them later.
//! let pending = Rc::new(RefCell::new(None));
//!
//! let token = CancelToken::new();
//! let request = {
//!     let pending = pending.clone();
//!     Request::<String, u16>::new(&token, move |completion, _token| {
//!         *pending.borrow_mut() = Some(completion);
//!     })
//! };
//! let _ = request.catch(|r| Ok(format!("{r}")));
//!
//! request.abort();
//!
//! // The transport answers anyway; the answer is ignored.
//! pending.borrow().as_ref().unwrap().succeed("late".into());
//!
//! Executor::run();
//! assert_eq!(request.state(), State::Rejected(Rejection::Aborted));
//! ```
use std::{
    fmt::Debug,
    future::IntoFuture,
    ops::Deref,
    rc::Rc,
};

use log::debug;

use crate::{
    cancel::CancelToken,
    deferred::{Deferred, Rejection, RejectionSink, Resolver, Settled},
};

/// The success/failure callback pair handed to a wrapped operation.
///
/// Cloning a completion yields another handle to the same pair; the first
/// callback to fire on any handle settles the request.
pub struct Completion<T, E> {
    resolver: Rc<Resolver<T, E>>,
}

impl<T, E> Clone for Completion<T, E> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
        }
    }
}

impl<T, E> Completion<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Success callback.
    pub fn succeed(&self, value: T) {
        if !self.resolver.resolve(value) {
            debug!("discarding success of an already settled request");
        }
    }

    /// Failure callback. Rejects with [Rejection::Failed].
    pub fn fail(&self, reason: E) {
        if !self.resolver.reject(reason) {
            debug!("discarding failure of an already settled request");
        }
    }

    /// Whether the request has settled (including by abort). Operations may
    /// use this to skip work whose result would be discarded.
    pub fn is_settled(&self) -> bool {
        self.resolver.is_settled()
    }
}

/// A deferred wrapping one external asynchronous operation, with `abort()`.
///
/// A request dereferences to its [Deferred], so `then`, `catch` and the state
/// queries can be called on it directly.
pub struct Request<T, E> {
    deferred: Deferred<T, E>,
    token: CancelToken,
}

impl<T, E> Request<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Start an operation.
    ///
    /// `start` is called before this function returns, with the completion
    /// callbacks and a token scoped to this request, which is cancelled
    /// together with `token`. An operation that can be stopped registers that
    /// with [CancelToken::on_cancel] on the scoped token. Its hooks are
    /// dropped once the request settles, so `token` may be shared by any
    /// number of requests. If `token` has already been cancelled, `start` is
    /// not called and the request rejects with [Rejection::Aborted].
    pub fn new(token: &CancelToken, start: impl FnOnce(Completion<T, E>, &CancelToken)) -> Self {
        Self::new_in(&RejectionSink::new(), token, start)
    }

    /// Like [Request::new], reporting unhandled rejections to `sink`.
    pub fn new_in(
        sink: &RejectionSink,
        token: &CancelToken,
        start: impl FnOnce(Completion<T, E>, &CancelToken),
    ) -> Self {
        let (deferred, resolver) = Deferred::pending_in(sink);
        let resolver = Rc::new(resolver);
        let scope = token.child();

        {
            let resolver = resolver.clone();
            scope.on_cancel(move || {
                if resolver.settle(Err(Rejection::Aborted)) {
                    debug!("request aborted");
                }
            });
        }

        if !scope.is_cancelled() {
            start(Completion { resolver }, &scope);
        }

        deferred.on_settled(move |_| scope.release());

        Self {
            deferred,
            token: token.clone(),
        }
    }

    /// Abort the request.
    ///
    /// This cancels the request's token: if the request is still pending it
    /// rejects with [Rejection::Aborted], and the underlying operation is
    /// asked to stop. Every other request sharing the token is aborted too.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn deferred(&self) -> &Deferred<T, E> {
        &self.deferred
    }

    pub fn into_deferred(self) -> Deferred<T, E> {
        self.deferred
    }
}

impl<T, E> Deref for Request<T, E> {
    type Target = Deferred<T, E>;

    fn deref(&self) -> &Self::Target {
        &self.deferred
    }
}

impl<T, E> IntoFuture for Request<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = <Deferred<T, E> as IntoFuture>::Output;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.deferred.into_future()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::{Completion, Request};
    use crate::{
        cancel::CancelToken,
        deferred::{Rejection, RejectionSink, State},
        task::Executor,
    };

    type Slot = Rc<RefCell<Option<Completion<u32, &'static str>>>>;

    /// A fake transport that parks its callbacks and records stop requests.
    fn transport(token: &CancelToken) -> (Request<u32, &'static str>, Slot, Rc<RefCell<bool>>) {
        let slot: Slot = Rc::new(RefCell::new(None));
        let stopped = Rc::new(RefCell::new(false));

        let request = {
            let slot = slot.clone();
            let stopped = stopped.clone();
            Request::new(token, move |completion, token| {
                *slot.borrow_mut() = Some(completion);
                token.on_cancel(move || *stopped.borrow_mut() = true);
            })
        };

        (request, slot, stopped)
    }

    #[test]
    fn success_resolves() {
        let (request, slot, _) = transport(&CancelToken::new());

        slot.borrow().as_ref().unwrap().succeed(7);
        Executor::run();

        assert_eq!(request.state(), State::Fulfilled(7));
    }

    #[test]
    fn failure_rejects_with_producer_reason() {
        let (request, slot, _) = transport(&CancelToken::new());
        let seen = request.catch(|r| {
            assert_eq!(r, Rejection::Failed("503"));
            Ok(0)
        });

        slot.borrow().as_ref().unwrap().fail("503");
        Executor::run();

        assert_eq!(seen.state(), State::Fulfilled(0));
    }

    #[test]
    fn abort_wins_over_late_success() {
        let (request, slot, stopped) = transport(&CancelToken::new());
        let _ = request.catch(|_| Ok(0));

        request.abort();
        assert!(*stopped.borrow());
        assert_eq!(request.state(), State::Rejected(Rejection::Aborted));

        let completion = slot.borrow_mut().take().unwrap();
        assert!(completion.is_settled());
        completion.succeed(1);
        completion.fail("late");

        Executor::run();
        assert_eq!(request.state(), State::Rejected(Rejection::Aborted));
    }

    #[test]
    fn abort_after_settlement_is_noop() {
        let (request, slot, _) = transport(&CancelToken::new());

        slot.borrow().as_ref().unwrap().succeed(2);
        request.abort();

        Executor::run();
        assert_eq!(request.state(), State::Fulfilled(2));
    }

    #[test]
    fn cancelled_token_skips_start() {
        let token = CancelToken::new();
        token.cancel();

        let (request, slot, _) = transport(&token);
        let _ = request.catch(|_| Ok(0));

        assert!(slot.borrow().is_none());
        assert_eq!(request.state(), State::Rejected(Rejection::Aborted));
    }

    #[test]
    fn shared_token_aborts_group() {
        let token = CancelToken::new();
        let (a, _, _) = transport(&token);
        let (b, _, _) = transport(&token);
        let (c, c_slot, _) = transport(&token.child());

        c_slot.borrow().as_ref().unwrap().succeed(3);
        a.abort();

        assert_eq!(a.state(), State::Rejected(Rejection::Aborted));
        assert_eq!(b.state(), State::Rejected(Rejection::Aborted));
        assert_eq!(c.state(), State::Fulfilled(3));
    }

    #[test]
    fn unobserved_abort_is_reported() {
        let sink = RejectionSink::new();
        let token = CancelToken::new();
        let request = Request::<u32, &str>::new_in(&sink, &token, |_, _| {});

        request.abort();
        Executor::run();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.reports()[0].reason, "Aborted");
    }

    #[test]
    fn awaiting_a_request() {
        let token = CancelToken::new();
        let request = Request::<u32, &str>::new(&token, |completion, _| {
            completion.succeed(40);
        });

        let v = Executor::block_on(async move { request.await.map(|v| v + 2) });
        assert_eq!(v, Ok(42));
    }

    #[test]
    fn settled_requests_leave_no_hooks_behind() {
        let token = CancelToken::new();

        let requests: Vec<_> = (0..1000)
            .map(|n| {
                Request::<u32, &str>::new(&token, move |completion, scope| {
                    scope.on_cancel(|| {});
                    completion.succeed(n);
                })
            })
            .collect();

        Executor::run();

        assert_eq!(token.hook_count(), 0);
        assert!(requests.iter().all(|r| r.is_fulfilled()));

        // The token still works for requests started afterwards.
        let (late, _, stopped) = transport(&token);
        assert_eq!(token.hook_count(), 1);

        token.cancel();
        assert!(*stopped.borrow());
        assert_eq!(late.state(), State::Rejected(Rejection::Aborted));
    }

    #[test]
    fn rejected_request_releases_its_hooks() {
        let token = CancelToken::new();
        let (request, slot, stopped) = transport(&token);
        let _ = request.catch(|_| Ok(0));

        slot.borrow().as_ref().unwrap().fail("503");
        Executor::run();

        assert_eq!(token.hook_count(), 0);

        token.cancel();
        assert!(!*stopped.borrow());
    }
}
