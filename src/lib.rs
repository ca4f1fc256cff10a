//! # `pledge`: deferreds for a single-threaded event loop
//!
//! This crate implements the asynchronous coordination core of a UI toolkit:
//! a [Deferred](deferred::Deferred) type that settles exactly once, a
//! chaining algebra (`then`, `catch`, flattening), combinators that aggregate
//! several deferreds, and adapters that turn callback-style operations
//! (including abortable io_uring requests) into deferreds.
//!
//! Everything runs on one thread. Settling a deferred never runs its
//! reactions right away; they are queued on the thread's
//! [Executor](task::Executor), which runs them in order on a later turn. See
//! the [task] module for how the executor loop works, and the [deferred]
//! module for the chaining rules.
//!
//! Rejections that no handler observes are reported to a
//! [RejectionSink](deferred::RejectionSink) owned by the application.
//!
//! ## Example
//!
//! Fetch two values, add them up, and recover from failures:
//!
//! ```
//! use pledge::adapter::Request;
//! use pledge::cancel::CancelToken;
//! use pledge::combinators::all;
//! use pledge::deferred::{RejectionSink, State};
//! use pledge::task::Executor;
//!
//! let sink = RejectionSink::new();
//! let token = CancelToken::new();
//!
//! let fetch = |n: u32| {
//!     Request::<u32, String>::new_in(&sink, &token, move |completion, _| {
//!         // A real transport would answer later, from a callback.
//!         pledge::task::Executor::defer(move || completion.succeed(n));
//!     })
//!     .into_deferred()
//! };
//!
//! let total = all([fetch(20), fetch(22)])
//!     .then(|values| Ok(values.iter().sum::<u32>()))
//!     .catch(|_| Ok(0));
//!
//! Executor::run();
//!
//! assert_eq!(total.state(), State::Fulfilled(42));
//! assert!(sink.is_empty());
//! ```
pub mod adapter;
pub mod cancel;
pub mod collection;
pub mod combinators;
pub mod deferred;
pub mod io;
pub(crate) mod reactor;
pub mod task;
