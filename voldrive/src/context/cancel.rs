//! Cancellation scopes backing [`Context`](super::Context) deadlines.
//!
//! Each `with_cancel`/`with_timeout` call creates a [`CancelState`] linked to
//! the nearest enclosing one. A scope is done when it or any ancestor was
//! cancelled, or when its effective deadline (the earliest deadline along the
//! chain) has passed.

use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

pub(crate) struct CancelState {
    reason: watch::Sender<Option<CancelReason>>,
    /// Earliest deadline of this scope and all ancestors.
    deadline: Option<Instant>,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    pub(crate) fn new(parent: Option<Arc<CancelState>>, deadline: Option<Instant>) -> Arc<Self> {
        let inherited = parent.as_ref().and_then(|p| p.deadline);
        let deadline = match (inherited, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let (reason, _) = watch::channel(None);
        Arc::new(Self {
            reason,
            deadline,
            parent,
        })
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn chain(&self) -> impl Iterator<Item = &CancelState> {
        std::iter::successors(Some(self), |s| s.parent.as_deref())
    }

    /// Mark this scope cancelled. A scope whose deadline already passed keeps
    /// reporting `DeadlineExceeded`.
    pub(crate) fn cancel(&self) {
        let reason = if self.deadline_passed() {
            CancelReason::DeadlineExceeded
        } else {
            CancelReason::Cancelled
        };
        self.reason.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Non-blocking check.
    pub(crate) fn reason(&self) -> Option<CancelReason> {
        for state in self.chain() {
            if let Some(reason) = *state.reason.borrow() {
                return Some(reason);
            }
        }
        if self.deadline_passed() {
            return Some(CancelReason::DeadlineExceeded);
        }
        None
    }

    /// Resolve once the scope is done.
    pub(crate) async fn done(&self) {
        if self.reason().is_some() {
            return;
        }

        let mut receivers: Vec<_> = self.chain().map(|s| s.reason.subscribe()).collect();
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                // Sender lives as long as the state we borrow from.
                let _ = rx.wait_for(|reason| reason.is_some()).await.map(|_| ());
            })
        });
        let any_cancelled = select_all(waits);

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = any_cancelled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                any_cancelled.await;
            }
        }
    }
}

/// Cancels the context it was returned with, and every context derived from it.
///
/// Dropping the handle does not cancel anything.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new(state: Arc<CancelState>) -> Self {
        Self { state }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.reason().is_some()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("reason", &self.state.reason())
            .finish()
    }
}
