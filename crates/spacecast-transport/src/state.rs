//! State shared by every connection implementation: the closed flag,
//! deadlines and the liveness callback.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::traits::{ConnectionError, LivenessHandler};

pub(crate) struct ConnectionState {
    closed: watch::Sender<bool>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    liveness: Mutex<Option<LivenessHandler>>,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            liveness: Mutex::new(None),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once the connection is marked closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn read_deadline(&self) -> Option<Instant> {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    pub(crate) fn write_deadline(&self) -> Option<Instant> {
        *self
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    pub(crate) fn set_liveness_handler(&self, handler: LivenessHandler) {
        *self.liveness.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub(crate) fn fire_liveness(&self) {
        // Clone out so the handler runs without the lock held
        let handler = self
            .liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// Run `fut`, failing with [`ConnectionError::Timeout`] once `deadline` passes.
pub(crate) async fn bounded<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, ConnectionError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| ConnectionError::Timeout),
        None => Ok(fut.await),
    }
}
