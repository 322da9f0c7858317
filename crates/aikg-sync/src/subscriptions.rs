//! Subscription CRUD with change events, and the per-subscription send schedule they drive.

use std::collections::HashSet;
use std::sync::Arc;

use aikg_adapters::Mailer;
use aikg_core::{
    NewSubscription, Subscription, SubscriptionChange, SubscriptionChangeKind, SubscriptionId,
};
use aikg_storage::{Store, StoreError};
use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::validate_cron;
use crate::content::{ContentGenerationFlow, GeneratedContent};
use crate::dispatch::Dispatcher;
use crate::registry::{job_task, CronBackend, JobRegistry, JobTask};

/// In-process publisher of subscription lifecycle events.
#[derive(Debug, Clone)]
pub struct ChangeEventBus {
    sender: mpsc::UnboundedSender<SubscriptionChange>,
}

impl ChangeEventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriptionChange>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, kind: SubscriptionChangeKind, subscription: Subscription) {
        let id = subscription.id;
        if self
            .sender
            .send(SubscriptionChange { kind, subscription })
            .is_err()
        {
            warn!(subscription_id = %id, ?kind, "no listener for subscription change");
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid subscription: {0}")]
    Invalid(String),
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

fn validate(subscription: &NewSubscription) -> SubscriptionResult<NewSubscription> {
    let area = subscription.area.trim();
    let reader = subscription.reader.trim();
    let email = subscription.reader_email.trim();
    if area.is_empty() {
        return Err(SubscriptionError::Invalid("area must not be empty".into()));
    }
    if reader.is_empty() {
        return Err(SubscriptionError::Invalid("reader must not be empty".into()));
    }
    if !is_plausible_email(email) {
        return Err(SubscriptionError::Invalid(format!(
            "reader_email {email:?} is not an email address"
        )));
    }
    Ok(NewSubscription {
        area: area.to_string(),
        reader: reader.to_string(),
        reader_email: email.to_string(),
        active: subscription.active,
        schedule_cron: normalize_cron(subscription.schedule_cron.as_deref())?,
    })
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// Blank crons mean "use the default"; anything else must parse.
fn normalize_cron(cron: Option<&str>) -> SubscriptionResult<Option<String>> {
    match cron.map(str::trim).filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(cron) => {
            validate_cron("schedule_cron", cron)
                .map_err(|e| SubscriptionError::Invalid(e.to_string()))?;
            Ok(Some(cron.to_string()))
        }
    }
}

/// Every successful mutation publishes exactly one change event.
pub struct SubscriptionService {
    store: Arc<dyn Store>,
    events: ChangeEventBus,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn Store>, events: ChangeEventBus) -> Self {
        Self { store, events }
    }

    pub async fn list(&self) -> SubscriptionResult<Vec<Subscription>> {
        Ok(self.store.list_subscriptions().await?)
    }

    pub async fn get(&self, id: SubscriptionId) -> SubscriptionResult<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or(SubscriptionError::NotFound(id))
    }

    pub async fn find_active(&self) -> SubscriptionResult<Vec<Subscription>> {
        Ok(self.store.find_active_subscriptions().await?)
    }

    pub async fn find_by_email(&self, email: &str) -> SubscriptionResult<Vec<Subscription>> {
        Ok(self.store.find_subscriptions_by_email(email.trim()).await?)
    }

    pub async fn find_by_area(&self, area: &str) -> SubscriptionResult<Vec<Subscription>> {
        Ok(self.store.find_subscriptions_by_area(area.trim()).await?)
    }

    pub async fn create(&self, subscription: NewSubscription) -> SubscriptionResult<Subscription> {
        let subscription = validate(&subscription)?;
        let created = self.store.insert_subscription(subscription).await?;
        info!(subscription_id = %created.id, area = %created.area, "subscription created");
        self.events
            .publish(SubscriptionChangeKind::Created, created.clone());
        Ok(created)
    }

    pub async fn update(
        &self,
        id: SubscriptionId,
        subscription: NewSubscription,
    ) -> SubscriptionResult<Subscription> {
        let subscription = validate(&subscription)?;
        let updated = self
            .store
            .update_subscription(id, subscription)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(subscription_id = %id, "subscription updated");
        self.events
            .publish(SubscriptionChangeKind::Updated, updated.clone());
        Ok(updated)
    }

    pub async fn delete(&self, id: SubscriptionId) -> SubscriptionResult<Subscription> {
        let removed = self
            .store
            .delete_subscription(id)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(subscription_id = %id, "subscription deleted");
        self.events
            .publish(SubscriptionChangeKind::Deleted, removed.clone());
        Ok(removed)
    }

    pub async fn activate(&self, id: SubscriptionId) -> SubscriptionResult<Subscription> {
        self.set_active(id, true, SubscriptionChangeKind::Activated)
            .await
    }

    pub async fn deactivate(&self, id: SubscriptionId) -> SubscriptionResult<Subscription> {
        self.set_active(id, false, SubscriptionChangeKind::Deactivated)
            .await
    }

    async fn set_active(
        &self,
        id: SubscriptionId,
        active: bool,
        kind: SubscriptionChangeKind,
    ) -> SubscriptionResult<Subscription> {
        let subscription = self
            .store
            .set_subscription_active(id, active)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(subscription_id = %id, active, "subscription status changed");
        self.events.publish(kind, subscription.clone());
        Ok(subscription)
    }

    /// `None` or a blank cron reverts to the system default schedule.
    pub async fn update_schedule_cron(
        &self,
        id: SubscriptionId,
        cron: Option<String>,
    ) -> SubscriptionResult<Subscription> {
        let cron = normalize_cron(cron.as_deref())?;
        let subscription = self
            .store
            .set_subscription_cron(id, cron)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        info!(
            subscription_id = %id,
            cron = subscription.schedule_cron.as_deref().unwrap_or("<default>"),
            "subscription schedule updated"
        );
        self.events
            .publish(SubscriptionChangeKind::ScheduleUpdated, subscription.clone());
        Ok(subscription)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSchedulerSettings {
    pub default_cron: String,
    pub admin_recipients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Deleted or deactivated since the job was scheduled.
    Skipped,
    Failed,
}

/// Keeps one live send job per active subscription.
pub struct SubscriptionScheduler {
    store: Arc<dyn Store>,
    registry: JobRegistry<SubscriptionId>,
    content: Arc<ContentGenerationFlow>,
    mailer: Arc<dyn Mailer>,
    dispatcher: Dispatcher,
    settings: SubscriptionSchedulerSettings,
}

impl SubscriptionScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn CronBackend>,
        content: Arc<ContentGenerationFlow>,
        mailer: Arc<dyn Mailer>,
        dispatcher: Dispatcher,
        settings: SubscriptionSchedulerSettings,
    ) -> Self {
        Self {
            store,
            registry: JobRegistry::new(backend),
            content,
            mailer,
            dispatcher,
            settings,
        }
    }

    pub fn registry(&self) -> &JobRegistry<SubscriptionId> {
        &self.registry
    }

    /// Schedules every active subscription; returns how many jobs were installed.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<usize> {
        let active = self
            .store
            .find_active_subscriptions()
            .await
            .context("loading active subscriptions")?;
        let mut scheduled = 0;
        for subscription in &active {
            match self.schedule(subscription).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(subscription_id = %subscription.id, error = ?err, "scheduling failed")
                }
            }
        }
        info!(scheduled, total = active.len(), "subscription jobs initialized");
        Ok(scheduled)
    }

    /// Replaces the subscription's job, or cancels it when inactive. Returns whether a job is
    /// now live.
    pub async fn schedule(self: &Arc<Self>, subscription: &Subscription) -> anyhow::Result<bool> {
        if !subscription.active {
            if self.registry.remove(&subscription.id).await {
                info!(subscription_id = %subscription.id, "inactive subscription unscheduled");
            }
            return Ok(false);
        }
        let cron = subscription.effective_cron(&self.settings.default_cron);
        self.registry
            .upsert(subscription.id, cron, self.send_task(subscription.id))
            .await?;
        Ok(true)
    }

    pub async fn unschedule(&self, id: SubscriptionId) -> bool {
        self.registry.remove(&id).await
    }

    /// Applies one change event. The stored row wins over the event payload, so redelivered or
    /// reordered events converge on the current configuration.
    pub async fn handle_change(self: &Arc<Self>, change: SubscriptionChange) {
        let id = change.subscription.id;
        debug!(subscription_id = %id, kind = ?change.kind, "subscription change received");
        let current = match self.store.get_subscription(id).await {
            Ok(current) => current,
            Err(err) => {
                warn!(subscription_id = %id, error = ?err, "reload failed; using event payload");
                Some(change.subscription).filter(|_| change.kind.requires_schedule())
            }
        };
        let result = match current {
            Some(subscription) => self.schedule(&subscription).await.map(|_| ()),
            None => {
                self.registry.remove(&id).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(subscription_id = %id, error = ?err, "applying subscription change failed");
        }
    }

    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SubscriptionChange>,
    ) {
        while let Some(change) = events.recv().await {
            self.handle_change(change).await;
        }
        debug!("subscription change channel closed");
    }

    /// Reschedules every active subscription and drops jobs for everything else.
    pub async fn refresh_all(self: &Arc<Self>) -> anyhow::Result<usize> {
        let active = self
            .store
            .find_active_subscriptions()
            .await
            .context("loading active subscriptions")?;
        let keep: HashSet<SubscriptionId> = active.iter().map(|s| s.id).collect();
        let dropped = self.registry.retain(|id| keep.contains(id)).await;
        let mut scheduled = 0;
        for subscription in &active {
            match self.schedule(subscription).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(subscription_id = %subscription.id, error = ?err, "rescheduling failed")
                }
            }
        }
        info!(scheduled, dropped, "subscription jobs refreshed");
        Ok(scheduled)
    }

    fn send_task(self: &Arc<Self>, id: SubscriptionId) -> JobTask {
        let scheduler = Arc::downgrade(self);
        job_task(move || {
            let scheduler = scheduler.clone();
            async move {
                let Some(this) = scheduler.upgrade() else {
                    return;
                };
                let worker = Arc::clone(&this);
                let job = async move { worker.run_send_job(id).await.map(|_| ()) }
                    .instrument(info_span!("send_job", subscription_id = %id));
                let handle = this.dispatcher.spawn("subscription_send", job);
                if let Err(err) = handle.await {
                    error!(subscription_id = %id, error = ?err, "send task aborted");
                }
            }
        })
    }

    /// Body of one scheduled firing. Failures are reported to the admins and never escape.
    pub async fn run_send_job(&self, id: SubscriptionId) -> anyhow::Result<SendOutcome> {
        let task_id = format!("task-{}-{}", Utc::now().timestamp_millis(), id);
        let started = std::time::Instant::now();

        let Some(subscription) = self.store.get_subscription(id).await? else {
            warn!(task_id = %task_id, subscription_id = %id, "subscription gone; send skipped");
            return Ok(SendOutcome::Skipped);
        };
        if !subscription.active {
            info!(task_id = %task_id, subscription_id = %id, "subscription inactive; send skipped");
            return Ok(SendOutcome::Skipped);
        }
        info!(
            task_id = %task_id,
            subscription_id = %id,
            area = %subscription.area,
            reader = %subscription.reader,
            "send job started"
        );

        let outcome = match self.deliver(&subscription).await {
            Ok(content) => {
                info!(
                    task_id = %task_id,
                    subscription_id = %id,
                    subject = %content.subject,
                    "send job succeeded"
                );
                SendOutcome::Sent
            }
            Err(err) => {
                error!(task_id = %task_id, subscription_id = %id, error = ?err, "send job failed");
                self.report_failure(&task_id).await;
                SendOutcome::Failed
            }
        };
        info!(task_id = %task_id, elapsed_secs = started.elapsed().as_secs(), "send job finished");
        Ok(outcome)
    }

    /// Generates and mails content for `subscription` right away, ignoring its status.
    pub async fn deliver(&self, subscription: &Subscription) -> anyhow::Result<GeneratedContent> {
        self.send_to(&subscription.area, &subscription.reader, &subscription.reader_email)
            .await
    }

    pub async fn send_now(&self, id: SubscriptionId) -> anyhow::Result<GeneratedContent> {
        let subscription = self
            .store
            .get_subscription(id)
            .await?
            .ok_or(SubscriptionError::NotFound(id))?;
        self.deliver(&subscription).await
    }

    pub async fn send_to(
        &self,
        area: &str,
        reader: &str,
        email: &str,
    ) -> anyhow::Result<GeneratedContent> {
        let content = self
            .content
            .generate(area, reader)
            .await
            .context("generating content")?;
        self.mailer
            .send_email(email, &content.subject, &content.body)
            .await
            .with_context(|| format!("sending to {email}"))?;
        Ok(content)
    }

    async fn report_failure(&self, task_id: &str) {
        let recipients = &self.settings.admin_recipients;
        if recipients.is_empty() {
            warn!(task_id = %task_id, "no admin recipients configured; failure report skipped");
            return;
        }
        let at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let body = failure_report_body(task_id, &at);
        match self
            .mailer
            .send_batch_email(recipients, FAILURE_REPORT_SUBJECT, &body)
            .await
        {
            Ok(()) => info!(task_id = %task_id, recipients = recipients.len(), "failure report sent"),
            Err(err) => error!(task_id = %task_id, error = ?err, "failure report could not be sent"),
        }
    }
}

pub const FAILURE_REPORT_SUBJECT: &str = "AIKG task report - partial failure";

fn failure_report_body(task_id: &str, at: &str) -> String {
    format!(
        "Task ID: {task_id}\nExecuted at: {at}\nSucceeded: 0\nFailed: 1\nTotal: 1\n\n\
         Check the system logs for details."
    )
}
