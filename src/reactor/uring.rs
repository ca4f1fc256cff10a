use std::io;

use io_uring::{opcode, squeue, IoUring};
use slab::Slab;

/// Submission queue depth of each per-thread ring.
pub(crate) const RING_ENTRIES: u32 = 1024;

/// `user_data` of cancellation requests. Never a valid slab key.
const CANCEL_TAG: u64 = u64::MAX;

pub(crate) struct ReactorUring<T> {
    uring: IoUring,
    ops: Slab<T>,
}

impl<T> ReactorUring<T> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            uring: IoUring::new(RING_ENTRIES)?,
            ops: Slab::new(),
        })
    }

    fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        // SAFETY: callers keep every buffer referenced by `entry` alive until
        // its completion has been reaped.
        if unsafe { self.uring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        self.uring.submit()?;

        unsafe { self.uring.submission().push(entry) }
            .map_err(|_| io::Error::other("io_uring submission queue is full"))
    }

    /// Queue `entry` for submission. `obj` is handed back by [Self::react]
    /// together with the operation's result once it completes.
    pub fn submit_io(&mut self, entry: squeue::Entry, obj: T) -> io::Result<usize> {
        let key = self.ops.insert(obj);

        if let Err(e) = self.push(&entry.user_data(key as u64)) {
            self.ops.remove(key);
            return Err(e);
        }

        Ok(key)
    }

    /// Ask the kernel to cancel the operation submitted under `key`.
    ///
    /// The cancelled operation still completes (usually with `-ECANCELED`)
    /// and is reported by [Self::react] like any other.
    pub fn cancel_io(&mut self, key: usize) -> io::Result<()> {
        if !self.ops.contains(key) {
            return Ok(());
        }

        let entry = opcode::AsyncCancel::new(key as u64)
            .build()
            .user_data(CANCEL_TAG);

        self.push(&entry)
    }

    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    /// Submit queued entries, wait for at least one completion and return
    /// every completed operation with its result.
    pub fn react(&mut self) -> io::Result<Vec<(T, i32)>> {
        match self.uring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let completions: Vec<(u64, i32)> = self
            .uring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        Ok(completions
            .into_iter()
            .filter(|(key, _)| *key != CANCEL_TAG)
            .filter_map(|(key, result)| {
                self.ops
                    .try_remove(key as usize)
                    .map(|obj| (obj, result))
            })
            .collect())
    }
}
