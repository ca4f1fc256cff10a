//! Scheduling and task management
//!
//! This module provides the per-thread [Executor] that every deferred in this
//! crate schedules its reactions on. Pledge uses a per-thread executor model:
//! each OS thread has its own job queue, its own set of tasks and its own
//! reactor. This means that:
//!
//! 1. Reactions of a deferred run on the thread that settled it.
//! 2. Each thread needs to call one of [Executor::block_on] or [Executor::run]
//!    for any reaction to run. Settling a deferred only *queues* its
//!    reactions.
//!
//! # Turns
//!
//! The executor loop works in turns:
//!
//! 1. Run queued jobs (reactions and [Executor::defer] callbacks) in FIFO
//!    order until the queue is empty. Jobs queued by jobs run in the same
//!    turn.
//! 2. Poll one woken task and go back to 1.
//! 3. Once no job and no task is runnable, report rejections that are still
//!    unobserved to their [RejectionSink](crate::deferred::RejectionSink).
//!    A task that `.await`s a deferred therefore observes it in time.
//! 4. If nothing is runnable but I/O is in flight, sleep in the reactor until
//!    a completion arrives.
//!
//! The loop returns once there are no jobs, no runnable tasks and no I/O left
//! in flight.
//!
//! # Example
//!
//! ```
//! use pledge::task::Executor;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let order = Rc::new(RefCell::new(Vec::new()));
//! {
//!     let order = order.clone();
//!     Executor::defer(move || order.borrow_mut().push("job"));
//! }
//! {
//!     let order = order.clone();
//!     Executor::spawn(async move { order.borrow_mut().push("task") });
//! }
//! Executor::run();
//! assert_eq!(*order.borrow(), vec!["job", "task"]);
//! ```
//!
//! ```
//! use pledge::task::Executor;
//! let x = Executor::block_on(async { 2 + 8 });
//! assert_eq!(x, 10);
//! ```
use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll, Wake, Waker},
};

use log::{error, trace};
use slab::Slab;

use crate::reactor::Reactor;

type Job = Box<dyn FnOnce()>;

const RUNNING: usize = usize::MAX;

/// Wake handle of a task.
///
/// `slot` is the task's key in the waiting slab, or [RUNNING] while the task
/// is being polled. A wake-up that arrives while the task is running is
/// remembered in `notified`.
struct TaskId {
    slot: AtomicUsize,
    notified: AtomicBool,
}

impl Wake for TaskId {
    fn wake(self: Arc<TaskId>) {
        EXEC.with(|exec| {
            let mut exec = exec.borrow_mut();
            let slot = self.slot.load(Ordering::Relaxed);

            if slot == RUNNING {
                self.notified.store(true, Ordering::Relaxed);
                return;
            }

            if let Some(task) = exec.waiting.try_remove(slot) {
                task.id.slot.store(RUNNING, Ordering::Relaxed);
                exec.run_q.push_back(task);
            }
        });
    }
}

struct Task {
    id: Arc<TaskId>,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

/// The per-thread executor.
///
/// See the [module-level documentation](self) for more information.
pub struct Executor {
    jobs: VecDeque<Job>,
    after_jobs: Vec<Job>,
    waiting: Slab<Task>,
    run_q: VecDeque<Task>,
}

thread_local! {
    static EXEC: RefCell<Executor> = const { RefCell::new(
        Executor {
            jobs: VecDeque::new(),
            after_jobs: Vec::new(),
            waiting: Slab::new(),
            run_q: VecDeque::new(),
        }
    )}
}

struct JoinSlot<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// A handle to a spawned task.
///
/// `.await` the joiner from another task to obtain the task's value, or call
/// [TaskJoiner::join] from a synchronous context. If the joiner is dropped,
/// the task still runs to completion but its value is lost.
pub struct TaskJoiner<T> {
    slot: Rc<RefCell<JoinSlot<T>>>,
}

impl<T> TaskJoiner<T> {
    /// Run this thread's executor and return the task's value.
    ///
    /// Returns `None` if the executor ran out of work before the task
    /// finished, which means the task waits on something that can no longer
    /// happen (e.g. a deferred whose resolver was dropped).
    ///
    /// *Note* This function should only be called from synchronous contexts.
    pub fn join(self) -> Option<T> {
        Executor::executor_loop();

        self.slot.borrow_mut().value.take()
    }
}

impl<T> Future for TaskJoiner<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();

        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Executor {
    /// Queue `f` to run on a later turn, after every job queued before it.
    ///
    /// This is the queue deferred reactions are dispatched on.
    pub fn defer(f: impl FnOnce() + 'static) {
        EXEC.with(|exec| exec.borrow_mut().jobs.push_back(Box::new(f)));
    }

    /// Queue `f` to run once the job queue has been drained.
    pub(crate) fn after_jobs(f: impl FnOnce() + 'static) {
        EXEC.with(|exec| exec.borrow_mut().after_jobs.push(Box::new(f)));
    }

    /// Spawn a new future and add it to this thread's run queue. If called
    /// from an already-running task, the future will be queued for execution.
    /// If called from a synchronous context, the task will *not* be executed
    /// until [Executor::run] is called.
    ///
    /// A [TaskJoiner] is returned which can be used to wait for completion of
    /// the future `f` and obtain its return value.
    pub fn spawn<Fut, T>(f: Fut) -> TaskJoiner<T>
    where
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        let slot = Rc::new(RefCell::new(JoinSlot {
            value: None,
            waker: None,
        }));
        let slot2 = slot.clone();

        let fut = async move {
            let value = f.await;
            let waker = {
                let mut slot = slot2.borrow_mut();
                slot.value = Some(value);
                slot.waker.take()
            };

            if let Some(waker) = waker {
                waker.wake();
            }
        };

        let task = Task {
            id: Arc::new(TaskId {
                slot: AtomicUsize::new(RUNNING),
                notified: AtomicBool::new(false),
            }),
            future: Box::pin(fut),
        };

        EXEC.with(|exec| {
            exec.borrow_mut().run_q.push_back(task);
        });

        TaskJoiner { slot }
    }

    /// A convenience function for waiting on a future from a synchronous
    /// context. This is the equivalent of calling:
    ///
    /// ```
    /// # use pledge::task::Executor;
    /// # use std::future::Future;
    /// # fn x<Fut: Future<Output = ()> + 'static>(f: Fut) {
    /// let task = Executor::spawn(f);
    /// task.join();
    /// # }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the executor runs out of work before `f` completes.
    pub fn block_on<Fut, T>(f: Fut) -> T
    where
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        Self::spawn(f)
            .join()
            .unwrap_or_else(|| panic!("block_on: future stalled with nothing left to wake it"))
    }

    /// Run the executor for this thread.
    ///
    /// Runs queued jobs, spawned tasks and in-flight I/O until none are left.
    /// *Note* only work queued on *this* thread is executed.
    pub fn run() {
        Self::executor_loop()
    }

    fn next_job() -> Option<Job> {
        EXEC.with(|exec| exec.borrow_mut().jobs.pop_front())
    }

    fn executor_loop() {
        loop {
            while let Some(job) = Self::next_job() {
                job();
            }

            if let Some(task) = EXEC.with(|exec| exec.borrow_mut().run_q.pop_front()) {
                Self::poll_task(task);
                continue;
            }

            let checks = EXEC.with(|exec| std::mem::take(&mut exec.borrow_mut().after_jobs));

            if !checks.is_empty() {
                trace!("running {} end-of-turn check(s)", checks.len());

                for check in checks {
                    check();
                }

                continue;
            }

            if Reactor::has_pending() {
                if let Err(e) = Reactor::react() {
                    error!("reactor failed: {e}");
                    panic!("io_uring reactor failed: {e}");
                }
                continue;
            }

            return;
        }
    }

    fn poll_task(mut task: Task) {
        let waker = Waker::from(task.id.clone());
        let mut cx = Context::from_waker(&waker);

        match task.future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => EXEC.with(|exec| {
                let mut exec = exec.borrow_mut();

                if task.id.notified.swap(false, Ordering::Relaxed) {
                    exec.run_q.push_back(task);
                    return;
                }

                let slot = exec.waiting.vacant_entry();
                task.id.slot.store(slot.key(), Ordering::Relaxed);
                slot.insert(task);
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, future::Future, pin::Pin, rc::Rc, task::Poll};

    use super::Executor;

    #[test]
    fn jobs_run_fifo() {
        let order = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            Executor::defer(move || {
                order.borrow_mut().push(n);
                if n == 0 {
                    let order = order.clone();
                    Executor::defer(move || order.borrow_mut().push(10));
                }
            });
        }

        Executor::run();

        assert_eq!(*order.borrow(), vec![0, 1, 2, 10]);
    }

    #[test]
    fn jobs_drain_before_tasks() {
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let order = order.clone();
            Executor::spawn(async move {
                order.borrow_mut().push("task");
                let o = order.clone();
                Executor::defer(move || o.borrow_mut().push("job from task"));
            });
        }

        {
            let order = order.clone();
            Executor::defer(move || order.borrow_mut().push("job"));
        }

        Executor::run();

        assert_eq!(*order.borrow(), vec!["job", "task", "job from task"]);
    }

    #[test]
    fn subtask_join() {
        let v = Executor::block_on(async {
            let t = Executor::spawn(async { 24 });
            t.await + 1
        });

        assert_eq!(v, 25);
    }

    #[test]
    fn wake_while_running_requeues() {
        struct YieldOnce(bool);

        impl Future for YieldOnce {
            type Output = ();

            fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<()> {
                if self.0 {
                    return Poll::Ready(());
                }

                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }

        let v = Executor::block_on(async {
            YieldOnce(false).await;
            YieldOnce(false).await;
            3
        });

        assert_eq!(v, 3);
    }

    #[test]
    fn stalled_task_joins_to_none() {
        let joiner = Executor::spawn(std::future::pending::<()>());

        assert!(joiner.join().is_none());
    }
}
