//! Keyed registry of live cron jobs, at most one per key.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Body of a scheduled job, invoked once per firing.
pub type JobTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub fn job_task<F, Fut>(body: F) -> JobTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(body()) })
}

/// Where jobs actually live. Removing a job stops future firings; a firing already in progress
/// runs to completion.
#[async_trait]
pub trait CronBackend: Send + Sync {
    async fn add(&self, cron: &str, task: JobTask) -> anyhow::Result<Uuid>;
    async fn remove(&self, job_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct TokioCronBackend {
    scheduler: JobScheduler,
}

impl TokioCronBackend {
    pub fn new(scheduler: JobScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl CronBackend for TokioCronBackend {
    async fn add(&self, cron: &str, task: JobTask) -> anyhow::Result<Uuid> {
        let job = Job::new_async(cron, move |_uuid, _l| {
            let task = Arc::clone(&task);
            Box::pin(async move { task().await })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        self.scheduler
            .add(job)
            .await
            .context("adding scheduler job")
    }

    async fn remove(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.scheduler
            .remove(&job_id)
            .await
            .with_context(|| format!("removing scheduler job {job_id}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveJob {
    pub job_id: Uuid,
    pub cron: String,
}

pub struct JobRegistry<K> {
    backend: Arc<dyn CronBackend>,
    jobs: Mutex<HashMap<K, LiveJob>>,
}

impl<K> JobRegistry<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync,
{
    pub fn new(backend: Arc<dyn CronBackend>) -> Self {
        Self {
            backend,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Cancels any job held for `key`, then installs one for `cron`. Both steps happen under
    /// the registry lock. If the new job cannot be created the key is left without a job.
    pub async fn upsert(&self, key: K, cron: &str, task: JobTask) -> anyhow::Result<Uuid> {
        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.remove(&key) {
            self.cancel(&key, previous).await;
        }
        let job_id = self.backend.add(cron, task).await?;
        jobs.insert(
            key.clone(),
            LiveJob {
                job_id,
                cron: cron.to_string(),
            },
        );
        info!(%key, cron, %job_id, "job scheduled");
        Ok(job_id)
    }

    /// Cancels the job for `key`; returns whether one existed.
    pub async fn remove(&self, key: &K) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(key) {
            Some(previous) => {
                self.cancel(key, previous).await;
                true
            }
            None => false,
        }
    }

    /// Cancels every job whose key fails `keep`; returns how many were cancelled.
    pub async fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&K) -> bool + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let stale: Vec<K> = jobs.keys().filter(|k| !keep(k)).cloned().collect();
        for key in &stale {
            if let Some(previous) = jobs.remove(key) {
                self.cancel(key, previous).await;
            }
        }
        stale.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    pub async fn cron_for(&self, key: &K) -> Option<String> {
        self.jobs.lock().await.get(key).map(|job| job.cron.clone())
    }

    async fn cancel(&self, key: &K, job: LiveJob) {
        match self.backend.remove(job.job_id).await {
            Ok(()) => debug!(%key, job_id = %job.job_id, "job cancelled"),
            Err(err) => warn!(%key, job_id = %job.job_id, error = ?err, "job cancel failed"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use crate::config::validate_cron;

    /// Tracks live job ids and validates crons like the real scheduler does.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub live: StdMutex<HashMap<Uuid, (String, JobTask)>>,
        pub removed: StdMutex<HashSet<Uuid>>,
    }

    impl FakeBackend {
        pub fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        pub fn live_crons(&self) -> Vec<String> {
            self.live
                .lock()
                .unwrap()
                .values()
                .map(|(cron, _)| cron.clone())
                .collect()
        }

        /// Fires every live job once, in no particular order.
        pub async fn fire_all(&self) {
            let tasks: Vec<JobTask> = self
                .live
                .lock()
                .unwrap()
                .values()
                .map(|(_, task)| Arc::clone(task))
                .collect();
            for task in tasks {
                task().await;
            }
        }
    }

    #[async_trait]
    impl CronBackend for FakeBackend {
        async fn add(&self, cron: &str, task: JobTask) -> anyhow::Result<Uuid> {
            validate_cron("job", cron)?;
            let id = Uuid::new_v4();
            self.live
                .lock()
                .unwrap()
                .insert(id, (cron.to_string(), task));
            Ok(id)
        }

        async fn remove(&self, job_id: Uuid) -> anyhow::Result<()> {
            self.live.lock().unwrap().remove(&job_id);
            self.removed.lock().unwrap().insert(job_id);
            Ok(())
        }
    }

    fn noop() -> JobTask {
        job_task(|| async {})
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let backend = Arc::new(FakeBackend::default());
        let registry = JobRegistry::new(backend.clone());

        let first = registry.upsert("s1".to_string(), "0 0 8 * * *", noop()).await.unwrap();
        let second = registry.upsert("s1".to_string(), "0 0 9 * * *", noop()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.len().await, 1);
        assert_eq!(backend.live_count(), 1);
        assert!(backend.removed.lock().unwrap().contains(&first));
        assert_eq!(
            registry.cron_for(&"s1".to_string()).await.as_deref(),
            Some("0 0 9 * * *")
        );
    }

    #[tokio::test]
    async fn concurrent_upserts_leave_one_job_per_key() {
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(JobRegistry::new(backend.clone()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("s{}", i % 4);
                registry.upsert(key, "0 0 8 * * *", noop()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 4);
        assert_eq!(backend.live_count(), 4);
    }

    #[tokio::test]
    async fn invalid_cron_leaves_no_job_behind() {
        let backend = Arc::new(FakeBackend::default());
        let registry = JobRegistry::new(backend.clone());
        registry.upsert(1u32, "0 0 8 * * *", noop()).await.unwrap();

        assert!(registry.upsert(1u32, "not a cron", noop()).await.is_err());
        assert!(registry.is_empty().await);
        assert_eq!(backend.live_count(), 0);
    }

    #[tokio::test]
    async fn remove_and_retain_cancel_jobs() {
        let backend = Arc::new(FakeBackend::default());
        let registry = JobRegistry::new(backend.clone());
        for key in 1u32..=4 {
            registry.upsert(key, "0 0 8 * * *", noop()).await.unwrap();
        }

        assert!(registry.remove(&1).await);
        assert!(!registry.remove(&1).await);
        assert_eq!(registry.retain(|k| *k % 2 == 0).await, 1);
        assert_eq!(registry.len().await, 2);
        assert_eq!(backend.live_count(), 2);
    }
}
