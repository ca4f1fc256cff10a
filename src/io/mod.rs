//! Abortable I/O requests.
//!
//! The functions in this module start an operation on this thread's io_uring
//! reactor and return it as a [Request]. The request settles once the kernel
//! reports a completion; failures reject with [Rejection::Failed] carrying the
//! [Errno] of the operation.
//!
//! Every function has an `_in` variant that takes the
//! [RejectionSink](crate::deferred::RejectionSink) unhandled rejections of the
//! request and of everything chained on it are reported to.
//!
//! Aborting a request rejects it with [Rejection::Aborted] and submits an
//! `IORING_OP_ASYNC_CANCEL` for the in-flight operation. Buffers stay owned by
//! the reactor until the kernel has reported the operation as finished.
//!
//! The following sub-modules are exposed:
//!
//! - `fs`: opening, reading and writing files.
//! - `timer`: sleeping for a duration.
//!
//! [Rejection::Failed]: crate::deferred::Rejection::Failed
//! [Rejection::Aborted]: crate::deferred::Rejection::Aborted
use std::{cell::Cell, io, rc::Rc};

use io_uring::squeue;
use log::debug;

use crate::{
    adapter::{Completion, Request},
    cancel::CancelToken,
    deferred::RejectionSink,
    reactor::Reactor,
};

pub mod fs;
pub mod timer;

pub use fs::{create, create_in, open, open_in, read, read_in, write, write_in, File};
pub use timer::{sleep, sleep_in};

/// An OS error number reported by a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{}", os_error(.0))]
pub struct Errno(pub i32);

fn os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

impl Errno {
    /// Interpret a raw io_uring result: `-errno` on failure.
    fn from_result(result: i32) -> Self {
        Self(-result)
    }
}

impl From<Errno> for io::Error {
    fn from(value: Errno) -> Self {
        io::Error::from_raw_os_error(value.0)
    }
}

impl From<&io::Error> for Errno {
    fn from(value: &io::Error) -> Self {
        Self(value.raw_os_error().unwrap_or(libc::EIO))
    }
}

/// Submit `entry` on the reactor as a request reporting to `sink`.
///
/// `finish` turns the raw completion result into the request's outcome. The
/// buffers `entry` points to must be owned by `finish`, which the reactor
/// keeps alive until the kernel is done with them.
pub(crate) fn submit<T>(
    sink: &RejectionSink,
    token: &CancelToken,
    entry: squeue::Entry,
    finish: impl FnOnce(i32, &Completion<T, Errno>) + 'static,
) -> Request<T, Errno>
where
    T: Clone + 'static,
{
    Request::new_in(sink, token, move |completion, token| {
        let done = Rc::new(Cell::new(false));
        let failed = completion.clone();

        let on_complete = {
            let done = done.clone();
            move |result: i32| {
                done.set(true);
                finish(result, &completion);
            }
        };

        match Reactor::submit(entry, on_complete) {
            Ok(key) => {
                token.on_cancel(move || {
                    if done.get() {
                        return;
                    }

                    if let Err(e) = Reactor::cancel(key) {
                        debug!("could not cancel io op {key}: {e}");
                    }
                });
            }
            Err(e) => {
                debug!("io submission failed: {e}");
                failed.fail(Errno::from(&e));
            }
        }
    })
}
