//! Per-thread io_uring reactor.
//!
//! Operations are submitted together with a completion callback. The
//! [Executor](crate::task::Executor) calls [Reactor::react] when it has nothing
//! else to run; that submits queued entries, sleeps until the kernel completes
//! at least one of them and then invokes the callbacks of every completed
//! operation with the raw result (`>= 0` on success, `-errno` on failure).
//!
//! The ring is created lazily on the first submission, so threads that never
//! perform I/O never touch io_uring.
use std::{cell::RefCell, io};

use io_uring::squeue;
use log::trace;
use uring::ReactorUring;

mod uring;

type Completion = Box<dyn FnOnce(i32)>;

/// Key of a submitted operation, usable with [Reactor::cancel].
pub(crate) type OpKey = usize;

pub(crate) struct Reactor {}

thread_local! {
    static REACTOR: RefCell<Option<ReactorUring<Completion>>> = const { RefCell::new(None) };
}

impl Reactor {
    fn with<R>(f: impl FnOnce(&mut ReactorUring<Completion>) -> io::Result<R>) -> io::Result<R> {
        REACTOR.with(|r| {
            let mut r = r.borrow_mut();

            let ring = match &mut *r {
                Some(ring) => ring,
                slot => slot.insert(ReactorUring::new()?),
            };

            f(ring)
        })
    }

    /// Submit `entry`. `on_complete` is called with the result once the
    /// kernel completes the operation.
    ///
    /// The caller must keep every buffer `entry` points to alive until
    /// `on_complete` runs; moving the buffer into `on_complete` does that.
    pub fn submit(entry: squeue::Entry, on_complete: impl FnOnce(i32) + 'static) -> io::Result<OpKey> {
        let key = Self::with(|ring| ring.submit_io(entry, Box::new(on_complete)))?;

        trace!("submitted io op {key}");

        Ok(key)
    }

    /// Request best-effort cancellation of an in-flight operation. Its
    /// completion callback still runs once the kernel reports it.
    pub fn cancel(key: OpKey) -> io::Result<()> {
        trace!("cancelling io op {key}");

        Self::with(|ring| ring.cancel_io(key))
    }

    pub fn has_pending() -> bool {
        REACTOR.with(|r| r.borrow().as_ref().is_some_and(|ring| ring.in_flight() > 0))
    }

    pub fn react() -> io::Result<()> {
        let completed = Self::with(|ring| ring.react())?;

        // The ring is released before callbacks run; they may submit more I/O.
        for (on_complete, result) in completed {
            on_complete(result);
        }

        Ok(())
    }
}
