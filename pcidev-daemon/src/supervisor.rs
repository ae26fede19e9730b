//! Fail-fast supervision of the agent's long-running tasks.
//!
//! All tasks run together; the first one to fail (or panic) triggers the
//! shared shutdown channel so the rest wind down, and its error becomes the
//! process result.

use pcidev_core::{PciDevError, Result};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

pub struct Supervisor {
    tasks: JoinSet<(&'static str, Result<()>)>,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(shutdown: broadcast::Sender<()>) -> Self {
        Self { tasks: JoinSet::new(), shutdown }
    }

    /// Start a named task.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Wait until every task has finished.
    ///
    /// Returns the first failure, if any.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(task = name, "Task finished");
                    continue;
                }
                Ok((name, Err(e))) => {
                    error!(task = name, error = %e, "Task failed, shutting down");
                    PciDevError::Internal(format!("{} failed: {}", name, e))
                }
                Err(e) => {
                    error!(error = %e, "Task panicked, shutting down");
                    PciDevError::internal(e)
                }
            };

            let _ = self.shutdown.send(());
            first_error.get_or_insert(failure);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
