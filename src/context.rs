//! Per-request cancellation context.
//!
//! A [`Context`] carries an optional deadline, a done signal and the reason
//! it finished. Every request gets one from the server; middleware may
//! replace it with a *derived* context (see [`Context::with_timeout`]) whose
//! cancellation fires whenever the parent's does, or earlier.
//!
//! ```text
//! background ─┬─ request ctx (cancelled when the request is torn down)
//!             │     └─ derived ctx (deadline = now + d, released by CancelGuard)
//! ```
//!
//! The done signal is a [`tokio::sync::watch`] channel holding
//! `Option<ContextError>`. The first cancellation wins; later ones are no-ops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Why a [`Context`] finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ContextError {
    /// Ordinary cancellation: the owner released the context, usually
    /// because the request completed.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline elapsed first.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cheaply-cloneable cancellation context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    deadline: Option<Instant>,
    // `None` until the context finishes.
    state: watch::Sender<Option<ContextError>>,
    // The background context can never finish.
    background: bool,
}

impl Context {
    /// The root context: no deadline, never cancelled.
    pub fn background() -> Self {
        Self::from_parts(None, true)
    }

    fn from_parts(deadline: Option<Instant>, background: bool) -> Self {
        let (state, _) = watch::channel(None);
        Self { inner: Arc::new(Inner { deadline, state, background }) }
    }

    /// Derives a child that finishes when `self` does or when the returned
    /// guard is dropped, whichever comes first.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime unless `self` is
    /// [`Context::background`]: any other parent is watched by a spawned
    /// task.
    pub fn with_cancel(&self) -> (Context, CancelGuard) {
        self.derive(self.deadline())
    }

    /// Derives a child with the given deadline. An earlier parent deadline
    /// is kept: a derived context never outlives its parent.
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime: the deadline is watched by a
    /// spawned task.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelGuard) {
        let deadline = match self.deadline() {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        self.derive(Some(deadline))
    }

    /// Derives a child whose deadline is `now + timeout`.
    ///
    /// # Panics
    ///
    /// Same as [`Context::with_deadline`].
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelGuard) {
        self.with_deadline(Instant::now() + timeout)
    }

    fn derive(&self, deadline: Option<Instant>) -> (Context, CancelGuard) {
        let child = Self::from_parts(deadline, false);

        // A child of the background context without a deadline can only be
        // finished by its guard, so no watcher is needed.
        let watcher = if self.inner.background && deadline.is_none() {
            None
        } else {
            let parent = self.clone();
            let target = child.clone();
            let task = tokio::spawn(async move {
                let reason = match deadline {
                    Some(at) => tokio::select! {
                        reason = parent.done() => reason,
                        () = tokio::time::sleep_until(at) => ContextError::DeadlineExceeded,
                    },
                    None => parent.done().await,
                };
                target.cancel(reason);
            });
            Some(task.abort_handle())
        };

        let guard = CancelGuard { ctx: child.clone(), watcher };
        (child, guard)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The termination reason, or `None` while the context is still live.
    pub fn err(&self) -> Option<ContextError> {
        *self.inner.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Suspends until the context finishes and returns why.
    ///
    /// Never resolves for [`Context::background`].
    pub async fn done(&self) -> ContextError {
        let mut rx = self.inner.state.subscribe();
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .map(|state| state.unwrap_or(ContextError::Canceled));
        // The sender lives in `self.inner`, so the channel cannot close here.
        reason.unwrap_or(ContextError::Canceled)
    }

    /// Finishes the context with `reason` unless it already finished.
    /// Returns `true` if this call did it.
    fn cancel(&self, reason: ContextError) -> bool {
        if self.inner.background {
            return false;
        }
        self.inner.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Releases a derived [`Context`].
///
/// Dropping the guard cancels the context with [`ContextError::Canceled`]
/// (if it has not finished already) and stops its parent/deadline watcher.
/// Because this happens in `Drop`, release also occurs while a panic
/// unwinds through the scope holding the guard.
#[must_use = "dropping the guard cancels the derived context immediately"]
pub struct CancelGuard {
    ctx: Context,
    watcher: Option<AbortHandle>,
}

impl CancelGuard {
    /// Cancels now. Equivalent to dropping the guard.
    pub fn cancel(self) {}
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.ctx.cancel(ContextError::Canceled);
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_has_no_deadline_and_is_live() {
        let ctx = Context::background();
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
        assert!(!ctx.cancel(ContextError::Canceled));
    }

    #[test]
    fn cancel_only_child_of_background_needs_no_runtime() {
        let (ctx, guard) = Context::background().with_cancel();
        drop(guard);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[test]
    #[should_panic]
    fn deadline_outside_runtime_panics() {
        let _ = Context::background().with_timeout(Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dropping_the_guard_cancels() {
        let (ctx, guard) = Context::background().with_cancel();
        assert!(ctx.err().is_none());
        drop(guard);
        assert_eq!(ctx.done().await, ContextError::Canceled);
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn deadline_fires_with_deadline_exceeded() {
        let (ctx, _guard) = Context::background().with_timeout(Duration::from_millis(20));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_child() {
        let (parent, parent_guard) = Context::background().with_cancel();
        let (child, _child_guard) = parent.with_timeout(Duration::from_secs(60));
        drop(parent_guard);
        assert_eq!(child.done().await, ContextError::Canceled);
    }

    #[tokio::test]
    async fn earlier_parent_deadline_wins() {
        let (parent, _pg) = Context::background().with_timeout(Duration::from_millis(50));
        let (child, _cg) = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn first_reason_sticks() {
        let (ctx, guard) = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        drop(guard);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
