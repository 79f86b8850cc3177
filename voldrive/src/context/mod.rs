//! Request-scoped context.
//!
//! A [`Context`] is immutable. Every `with_*` call returns a derived context
//! that points back at its parent through an `Arc`, so the parent is never
//! modified and both can be handed to concurrent consumers. Values resolve
//! from the nearest ancestor outward.
//!
//! Log verbosity, path configuration, the active service and the executor
//! handle all travel as values here rather than as process globals, so two
//! concurrent requests can carry different settings.

mod cancel;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::level_filters::LevelFilter;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use crate::executor::ExecutorHandle;
use crate::paths::PathConfig;

pub use cancel::{CancelHandle, CancelReason};
use cancel::CancelState;

/// Key under which a context value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(&'static str);

impl ContextKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

/// Well-known context keys.
pub mod keys {
    use super::ContextKey;

    /// [`PathConfig`](crate::paths::PathConfig)
    pub const PATH_CONFIG: ContextKey = ContextKey::new("path_config");
    /// `tracing::level_filters::LevelFilter`
    pub const LOG_LEVEL: ContextKey = ContextKey::new("log_level");
    /// `String`: service name of the request.
    pub const SERVICE: ContextKey = ContextKey::new("service");
    /// `String`: driver bound to the service.
    pub const DRIVER: ContextKey = ContextKey::new("driver");
    /// `String`: configured libStorage-style host.
    pub const HOST: ContextKey = ContextKey::new("host");
    /// [`ExecutorHandle`](crate::executor::ExecutorHandle)
    pub const EXECUTOR: ContextKey = ContextKey::new("executor");
}

/// Correlates all log lines and executor invocations of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type AnyValue = Arc<dyn Any + Send + Sync>;

struct Node {
    parent: Option<Arc<Node>>,
    value: Option<(ContextKey, AnyValue)>,
    // Inherited copies; changing them derives a new node.
    transaction_id: Option<TransactionId>,
    cancel: Option<Arc<CancelState>>,
}

#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// Root context: no values, no deadline, never cancelled.
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                value: None,
                transaction_id: None,
                cancel: None,
            }),
        }
    }

    fn derive(
        &self,
        value: Option<(ContextKey, AnyValue)>,
        transaction_id: Option<TransactionId>,
        cancel: Option<Arc<CancelState>>,
    ) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(Arc::clone(&self.node)),
                value,
                transaction_id,
                cancel,
            }),
        }
    }

    // ========================================================================
    // VALUES
    // ========================================================================

    pub fn with_value<T>(&self, key: ContextKey, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.derive(
            Some((key, Arc::new(value))),
            self.node.transaction_id.clone(),
            self.node.cancel.clone(),
        )
    }

    /// Look up `key`, nearest ancestor first.
    ///
    /// Returns `None` when the key is absent or the nearest value for it is
    /// not a `T`.
    pub fn value<T>(&self, key: ContextKey) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        let mut current = Some(self.node.as_ref());
        while let Some(node) = current {
            if let Some((k, v)) = &node.value {
                if *k == key {
                    return v.downcast_ref::<T>();
                }
            }
            current = node.parent.as_deref();
        }
        None
    }

    pub fn with_transaction_id(&self, id: TransactionId) -> Self {
        self.derive(None, Some(id), self.node.cancel.clone())
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.node.transaction_id.as_ref()
    }

    pub fn path_config(&self) -> Option<&PathConfig> {
        self.value::<PathConfig>(keys::PATH_CONFIG)
    }

    pub fn log_level(&self) -> Option<LevelFilter> {
        self.value::<LevelFilter>(keys::LOG_LEVEL).copied()
    }

    pub fn service(&self) -> Option<&str> {
        self.value::<String>(keys::SERVICE).map(String::as_str)
    }

    pub fn driver_name(&self) -> Option<&str> {
        self.value::<String>(keys::DRIVER).map(String::as_str)
    }

    pub fn executor(&self) -> Option<&ExecutorHandle> {
        self.value::<ExecutorHandle>(keys::EXECUTOR)
    }

    /// The executor bound to this request, or `Internal` when the context
    /// did not come through the router.
    pub fn require_executor(&self) -> VoldriveResult<&ExecutorHandle> {
        self.executor().ok_or_else(|| {
            VoldriveError::Internal("no executor bound to the request context".into())
        })
    }

    // ========================================================================
    // CANCELLATION
    // ========================================================================

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        self.with_cancel_state(None)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.with_cancel_state(Some(Instant::now() + timeout))
    }

    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        self.with_cancel_state(Some(deadline))
    }

    fn with_cancel_state(&self, deadline: Option<Instant>) -> (Self, CancelHandle) {
        let state = CancelState::new(self.node.cancel.clone(), deadline);
        let ctx = self.derive(
            None,
            self.node.transaction_id.clone(),
            Some(Arc::clone(&state)),
        );
        (ctx, CancelHandle::new(state))
    }

    /// Same values and transaction id, but no deadline and never cancelled.
    ///
    /// For work that must finish even when the request that started it ends.
    pub fn without_cancel(&self) -> Self {
        self.derive(None, self.node.transaction_id.clone(), None)
    }

    /// Effective deadline: the earliest one along the ancestor chain.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.cancel.as_ref().and_then(|c| c.deadline())
    }

    /// Time left until the deadline, zero once it passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.node.cancel.as_ref().and_then(|c| c.reason())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// The error a caller should see if it stops because of this context.
    pub fn err(&self) -> Option<VoldriveError> {
        self.err_for("request")
    }

    /// Like [`err`](Self::err), naming the interrupted work.
    pub fn err_for(&self, what: &str) -> Option<VoldriveError> {
        self.cancel_reason().map(|reason| self.reason_error(reason, what))
    }

    fn reason_error(&self, reason: CancelReason, what: &str) -> VoldriveError {
        let tx = self
            .transaction_id()
            .map(|t| format!(" (tx {})", t))
            .unwrap_or_default();
        match reason {
            CancelReason::DeadlineExceeded => {
                VoldriveError::DeadlineExceeded(format!("{}{}", what, tx))
            }
            CancelReason::Cancelled => VoldriveError::Cancelled(format!("{}{}", what, tx)),
        }
    }

    /// Wait until the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a context without a cancellation scope.
    pub async fn done(&self) {
        match &self.node.cancel {
            Some(state) => state.done().await,
            None => futures::future::pending::<()>().await,
        }
    }

    /// Run `fut` bounded by this context.
    ///
    /// Returns `DeadlineExceeded`/`Cancelled` without polling `fut` when the
    /// context is already done, and drops `fut` as soon as it becomes done.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> VoldriveResult<T>
    where
        F: Future<Output = VoldriveResult<T>>,
    {
        if let Some(reason) = self.cancel_reason() {
            return Err(self.reason_error(reason, what));
        }

        tokio::select! {
            biased;
            _ = self.done() => {
                let reason = self.cancel_reason().unwrap_or(CancelReason::Cancelled);
                Err(self.reason_error(reason, what))
            }
            result = fut => result,
        }
    }

    // ========================================================================
    // LOGGING
    // ========================================================================

    /// Span carrying the request's correlation fields.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            tx = %self.transaction_id().map(TransactionId::as_str).unwrap_or("-"),
            service = self.service().unwrap_or("-"),
            driver = self.driver_name().unwrap_or("-"),
        )
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("transaction_id", &self.transaction_id())
            .field("service", &self.service())
            .field("deadline", &self.deadline())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// Contexts are handed across tasks freely.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Context>;
};
