//! Cooperative cancellation.
//!
//! A [CancelToken] is handed to every [Request](crate::adapter::Request) at
//! construction. Cancelling the token aborts every request created with it;
//! each request rejects with [Rejection::Aborted](crate::deferred::Rejection)
//! and asks its underlying operation to stop. Stopping is best effort: the
//! operation may still finish, but its outcome is discarded.
//!
//! ```
//! use pledge::cancel::CancelToken;
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let token = CancelToken::new();
//! let hits = Rc::new(Cell::new(0));
//! {
//!     let hits = hits.clone();
//!     token.on_cancel(move || hits.set(hits.get() + 1));
//! }
//!
//! assert!(token.cancel());
//! assert!(!token.cancel());
//! assert_eq!(hits.get(), 1);
//! ```
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use log::debug;
use slab::Slab;

type Hook = Box<dyn FnOnce()>;

/// Registration of a hook, usable with [CancelToken::remove_hook].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookKey {
    slot: usize,
    seq: u64,
}

#[derive(Default)]
struct TokenInner {
    cancelled: Cell<bool>,
    hooks: RefCell<Slab<(u64, Hook)>>,
    next_seq: Cell<u64>,
    parent: RefCell<Option<(Weak<TokenInner>, HookKey)>>,
}

impl TokenInner {
    fn remove(&self, key: HookKey) -> Option<Hook> {
        let mut hooks = self.hooks.borrow_mut();

        if !hooks.get(key.slot).is_some_and(|(seq, _)| *seq == key.seq) {
            return None;
        }

        Some(hooks.remove(key.slot).1)
    }

    fn unlink(&self) {
        let Some((parent, key)) = self.parent.borrow_mut().take() else {
            return;
        };

        if let Some(parent) = parent.upgrade() {
            // Dropped after the parent's hooks are released.
            let hook = parent.remove(key);
            drop(hook);
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        self.unlink();
    }
}

/// A shareable, one-shot cancellation signal.
///
/// Cloning a token yields another handle to the same signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Rc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Cancel the token, running every registered hook in registration
    /// order. Returns `false` if the token had already been cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.replace(true) {
            return false;
        }

        self.inner.unlink();

        let mut hooks: Vec<_> = self.inner.hooks.borrow_mut().drain().collect();
        hooks.sort_by_key(|(seq, _)| *seq);

        debug!("cancelling token, {} hook(s)", hooks.len());

        for (_, hook) in hooks {
            hook();
        }

        true
    }

    /// Run `hook` when the token is cancelled, or right away if it already
    /// has been.
    ///
    /// Returns the registration, or `None` if the hook already ran. A hook
    /// that is no longer needed should be removed with
    /// [CancelToken::remove_hook]; the token keeps it otherwise.
    pub fn on_cancel(&self, hook: impl FnOnce() + 'static) -> Option<HookKey> {
        if self.is_cancelled() {
            hook();
            return None;
        }

        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);

        let slot = self.inner.hooks.borrow_mut().insert((seq, Box::new(hook)));

        Some(HookKey { slot, seq })
    }

    /// Drop a hook without running it. Returns `false` if it had already run
    /// or been removed.
    pub fn remove_hook(&self, key: HookKey) -> bool {
        let hook = self.inner.remove(key);
        hook.is_some()
    }

    /// A new token that is cancelled whenever this one is, and that can also
    /// be cancelled on its own.
    ///
    /// The link to this token is dropped once the child is cancelled or
    /// dropped.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let weak = Rc::downgrade(&child.inner);

        let key = self.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                CancelToken { inner }.cancel();
            }
        });

        if let Some(key) = key {
            *child.inner.parent.borrow_mut() = Some((Rc::downgrade(&self.inner), key));
        }

        child
    }

    /// Stop following the parent and drop every hook without running it.
    pub(crate) fn release(&self) {
        self.inner.unlink();

        let hooks = std::mem::take(&mut *self.inner.hooks.borrow_mut());
        drop(hooks);
    }

    pub(crate) fn hook_count(&self) -> usize {
        self.inner.hooks.borrow().len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("hooks", &self.hook_count())
            .finish()
    }
}
