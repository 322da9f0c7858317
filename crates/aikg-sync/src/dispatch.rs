//! Bounded fire-and-forget task pool.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawns tasks that wait for one of `capacity` permits before running. Task errors are
/// logged and never reach the caller or sibling tasks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently holding a permit.
    pub fn busy(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, task: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(task, "dispatcher closed; task dropped");
                return;
            };
            if let Err(err) = work.await {
                error!(task, error = ?err, "dispatched task failed");
            }
        })
    }

    /// Stops handing out permits; queued tasks are dropped.
    pub fn close(&self) {
        self.permits.close();
    }
}
