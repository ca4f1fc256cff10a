//! Rejection reasons and the unhandled rejection sink.
//!
//! Every rejected [Deferred](super::Deferred) carries a [Rejection], which
//! records *why* it failed: the wrapped operation failed, a handler in a chain
//! failed, or the operation was aborted on purpose.
//!
//! A rejection that nobody observes is not dropped on the floor. Once the
//! executor has run every queued reaction, deferreds that rejected without a
//! single reaction attached are reported to their [RejectionSink]. The sink is
//! an ordinary value owned by the application and handed to the root deferred
//! at construction; deferreds derived from it inherit the same sink.
//!
//! ```
//! use pledge::deferred::{Deferred, RejectionSink};
//! use pledge::task::Executor;
//!
//! let sink = RejectionSink::new();
//! let d = Deferred::<(), &str>::new_in(&sink, |resolver| {
//!     resolver.reject("nobody is listening");
//! });
//! let _chained = d.then(|()| Ok(()));
//!
//! Executor::run();
//! assert_eq!(sink.len(), 1);
//! ```
use std::{
    cell::RefCell,
    fmt::{self, Debug},
    rc::Rc,
};

use log::warn;

/// The reason a deferred rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection<E> {
    /// The wrapped asynchronous operation reported a failure.
    #[error("operation failed: {0:?}")]
    Failed(E),
    /// A handler registered with `then`/`catch` returned an error.
    #[error("handler failed: {0:?}")]
    Handler(E),
    /// The operation was cancelled through its
    /// [CancelToken](crate::cancel::CancelToken).
    #[error("operation aborted")]
    Aborted,
}

impl<E> Rejection<E> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// The payload of a producer or handler failure.
    pub fn reason(&self) -> Option<&E> {
        match self {
            Self::Failed(e) | Self::Handler(e) => Some(e),
            Self::Aborted => None,
        }
    }

    pub fn into_reason(self) -> Option<E> {
        match self {
            Self::Failed(e) | Self::Handler(e) => Some(e),
            Self::Aborted => None,
        }
    }
}

/// A rejection that reached the end of its chain without being observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledRejection {
    /// [Deferred::id](super::Deferred::id) of the rejected deferred.
    pub deferred: u64,
    /// The rejection, rendered with its `Debug` representation.
    pub reason: String,
}

type Hook = Box<dyn FnMut(&UnhandledRejection)>;

#[derive(Default)]
struct SinkInner {
    reports: Vec<UnhandledRejection>,
    hook: Option<Hook>,
}

/// Collector for unhandled rejections.
///
/// Cloning a sink yields another handle to the same collector.
#[derive(Clone, Default)]
pub struct RejectionSink {
    inner: Rc<RefCell<SinkInner>>,
}

impl RejectionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a callback that is invoked for every new report, in addition to
    /// the report being queued. Replaces any earlier hook.
    pub fn on_report(&self, hook: impl FnMut(&UnhandledRejection) + 'static) {
        self.inner.borrow_mut().hook = Some(Box::new(hook));
    }

    pub(crate) fn report(&self, rejection: UnhandledRejection) {
        warn!(
            "unhandled rejection of deferred #{}: {}",
            rejection.deferred, rejection.reason
        );

        // The hook is taken out while it runs so that it may use this sink.
        let hook = self.inner.borrow_mut().hook.take();

        if let Some(mut hook) = hook {
            hook(&rejection);

            let mut inner = self.inner.borrow_mut();
            if inner.hook.is_none() {
                inner.hook = Some(hook);
            }
        }

        self.inner.borrow_mut().reports.push(rejection);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().reports.is_empty()
    }

    /// A copy of every report received so far.
    pub fn reports(&self) -> Vec<UnhandledRejection> {
        self.inner.borrow().reports.clone()
    }

    /// Remove and return every report received so far.
    pub fn take(&self) -> Vec<UnhandledRejection> {
        std::mem::take(&mut self.inner.borrow_mut().reports)
    }
}

impl Debug for RejectionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();

        f.debug_struct("RejectionSink")
            .field("reports", &inner.reports)
            .field("hook", &inner.hook.is_some())
            .finish()
    }
}
