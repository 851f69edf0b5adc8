//! Fatal error reporting from worker tasks to the main server loop
//!
//! Expected failures (a client dropping, a malformed payload) are handled
//! where they happen. Anything else a worker cannot recover from is written
//! into a single shared cell; the first fault wins and the main loop shuts
//! the whole server down when it sees one.

use log::error;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ServerFault {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("task `{task}` panicked")]
    TaskPanicked { task: String },

    #[error("task `{task}` failed: {message}")]
    Worker { task: String, message: String },
}

/// Single-slot, first-writer-wins holder for the fault that ends the server
#[derive(Debug, Default)]
pub struct FaultCell {
    pending: Mutex<Option<ServerFault>>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the fault unless one is already pending; returns whether it was kept
    pub fn report(&self, fault: ServerFault) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return false;
        }
        error!("Fatal server fault: {}", fault);
        *pending = Some(fault);
        true
    }

    pub fn is_set(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn take(&self) -> Option<ServerFault> {
        self.pending.lock().take()
    }
}

/// Spawns a worker whose error or panic is routed into the fault cell
///
/// Cancellation of the worker is not a fault.
pub fn spawn_worker<F>(faults: Arc<FaultCell>, task: &str, work: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), ServerFault>> + Send + 'static,
{
    let task = task.to_string();
    let inner = tokio::spawn(work);

    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => {
                faults.report(fault);
            }
            Err(join_error) if join_error.is_panic() => {
                faults.report(ServerFault::TaskPanicked { task });
            }
            Err(_) => {}
        }
    })
}
