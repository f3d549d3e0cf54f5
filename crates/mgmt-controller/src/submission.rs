//! Submissions and cancellation
//!
//! A [`Submission`] wraps a request with its per-call controls. Cancellation
//! is cooperative: the kernel checks the token between steps and races it
//! against handler execution and lock waits.

use mgmt_model::{Operation, Request};
use std::time::Duration;
use tokio::sync::watch;

/// A request plus its execution controls
#[derive(Debug, Clone)]
pub struct Submission {
    pub(crate) request: Request,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancelToken>,
}

impl Submission {
    /// One operation
    #[must_use]
    pub fn single(operation: Operation) -> Self {
        Self::from_request(Request::Single(operation))
    }

    /// Atomic batch; sub-operations run in the given order
    #[must_use]
    pub fn composite(operations: Vec<Operation>) -> Self {
        Self::from_request(Request::Composite(operations))
    }

    /// Submission for an already-built request
    #[must_use]
    pub fn from_request(request: Request) -> Self {
        Self {
            request,
            timeout: None,
            cancel: None,
        }
    }

    /// Override the configured deadline for this submission
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Observe `token` for cancellation
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Request to run
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }
}

impl From<Operation> for Submission {
    fn from(operation: Operation) -> Self {
        Self::single(operation)
    }
}

impl From<Request> for Submission {
    fn from(request: Request) -> Self {
        Self::from_request(request)
    }
}

/// Linked handle/token pair
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Requests cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every submission watching the paired token
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is dropped first
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Wait on an optional token
pub(crate) async fn cancelled(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
