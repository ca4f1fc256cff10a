//! Timer requests.
//!
//! [sleep] completes after a duration has elapsed, using io_uring's
//! `IORING_OP_TIMEOUT`. Racing it against another request is how a timeout
//! is put on an operation:
//!
//! ```no_run
//! use pledge::cancel::CancelToken;
//! use pledge::combinators::race;
//! use pledge::io::{self, Errno};
//! use pledge::task::Executor;
//! use std::time::Duration;
//!
//! let token = CancelToken::new();
//! let file = io::open(&token, "/etc/hostname").into_deferred();
//! let timeout = io::sleep(&token, Duration::from_millis(250))
//!     .then(|()| Err::<io::File, _>(Errno(libc::ETIMEDOUT)));
//!
//! // Whichever loses is aborted once the race is decided.
//! let first = race([file, timeout]).finally(move || {
//!     token.cancel();
//! });
//!
//! let outcome = Executor::block_on(async move { first.await });
//! ```
use std::time::Duration;

use io_uring::{opcode, types};

use super::{submit, Errno};
use crate::{adapter::Request, cancel::CancelToken, deferred::RejectionSink};

/// Complete after `duration` has elapsed.
///
/// The request is guaranteed not to fulfil before `duration` has passed; it
/// may fulfil later.
pub fn sleep(token: &CancelToken, duration: Duration) -> Request<(), Errno> {
    sleep_in(&RejectionSink::new(), token, duration)
}

pub fn sleep_in(sink: &RejectionSink, token: &CancelToken, duration: Duration) -> Request<(), Errno> {
    let ts = Box::new(
        types::Timespec::new()
            .sec(duration.as_secs())
            .nsec(duration.subsec_nanos()),
    );

    let entry = opcode::Timeout::new(&*ts as *const types::Timespec).build();

    submit(sink, token, entry, move |result, completion| {
        drop(ts);

        // An expired timeout completes with -ETIME.
        if result >= 0 || result == -libc::ETIME {
            completion.succeed(());
        } else {
            completion.fail(Errno::from_result(result));
        }
    })
}
