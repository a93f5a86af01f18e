//! Failure notifications.
//!
//! The scheduler hands every terminal task failure to a [`CallbackDispatcher`],
//! which fans the record out to the registered [`Notifier`]s. Delivery errors
//! are logged and dropped; they never change task or run state. A notifier
//! that panics is treated as a failed delivery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::{DagError, RunId, RunReport, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub graph_id: String,
    pub run_id: RunId,
    pub run_key: String,
    pub task: String,
    pub attempt: u32,
    pub error: String,
    pub log_reference: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        graph_id: impl Into<String>,
        run_id: RunId,
        run_key: impl Into<String>,
        task: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            run_id,
            run_key: run_key.into(),
            task: task.into(),
            attempt,
            error: error.into(),
            log_reference: None,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, record: &FailureRecord) -> Result<(), DagError>;

    /// Called once when a run finishes as failed.
    async fn notify_run(&self, _report: &RunReport) -> Result<(), DagError> {
        Ok(())
    }
}

/// Sends one rendered email. Delivery itself lives outside this crate.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<(), DagError>;
}

/// Posts a JSON payload to a chat webhook.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), DagError>;
}

pub struct EmailNotifier {
    recipients: Vec<String>,
    transport: Arc<dyn MailTransport>,
}

impl EmailNotifier {
    pub fn new(recipients: Vec<String>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            recipients,
            transport,
        }
    }

    pub fn subject(record: &FailureRecord) -> String {
        format!("Task failed: {}.{} ({})", record.graph_id, record.task, record.run_key)
    }

    pub fn body(record: &FailureRecord) -> String {
        let mut body = format!(
            "Task: {}\nRun: {} ({})\nAttempt: {}\nFailed at: {}\nError: {}\n",
            record.task,
            record.run_key,
            record.run_id,
            record.attempt,
            record.failed_at.to_rfc3339(),
            record.error,
        );
        if let Some(log) = &record.log_reference {
            body.push_str(&format!("Log: {}\n", log));
        }
        body
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, record: &FailureRecord) -> Result<(), DagError> {
        if self.recipients.is_empty() {
            return Ok(());
        }
        self.transport
            .send(&self.recipients, &Self::subject(record), &Self::body(record))
            .await
    }

    async fn notify_run(&self, report: &RunReport) -> Result<(), DagError> {
        if self.recipients.is_empty() || report.status != RunStatus::Failed {
            return Ok(());
        }
        let subject = format!("Run failed: {} ({})", report.graph_id, report.run_key);
        self.transport
            .send(&self.recipients, &subject, &report.to_string())
            .await
    }
}

pub struct ChatNotifier {
    webhook_url: String,
    transport: Arc<dyn WebhookTransport>,
}

impl ChatNotifier {
    pub fn new(webhook_url: impl Into<String>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            transport,
        }
    }

    pub fn payload(record: &FailureRecord) -> serde_json::Value {
        let mut text = format!(
            ":red_circle: *{}.{}* failed on attempt {} for run `{}`: {}",
            record.graph_id, record.task, record.attempt, record.run_key, record.error
        );
        if let Some(log) = &record.log_reference {
            text.push_str(&format!(" (<{}|log>)", log));
        }
        json!({ "text": text, "failure": record })
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn name(&self) -> &str {
        "chat"
    }

    async fn notify(&self, record: &FailureRecord) -> Result<(), DagError> {
        self.transport
            .post(&self.webhook_url, &Self::payload(record))
            .await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "noop"
    }

    async fn notify(&self, _record: &FailureRecord) -> Result<(), DagError> {
        Ok(())
    }
}

/// Delivers to every child, even after one fails.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn push(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    fn collect(results: Vec<(String, Result<(), DagError>)>) -> Result<(), DagError> {
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, r)| r.err().map(|e| format!("{}: {}", name, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DagError::NotificationDelivery(failures.join("; ")))
        }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    fn name(&self) -> &str {
        "composite"
    }

    async fn notify(&self, record: &FailureRecord) -> Result<(), DagError> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push((notifier.name().to_string(), notifier.notify(record).await));
        }
        Self::collect(results)
    }

    async fn notify_run(&self, report: &RunReport) -> Result<(), DagError> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push((notifier.name().to_string(), notifier.notify_run(report).await));
        }
        Self::collect(results)
    }
}

#[derive(Clone, Default)]
pub struct CallbackDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    log_base_url: Option<String>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_base_url(mut self, url: impl Into<String>) -> Self {
        self.log_base_url = Some(url.into());
        self
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn log_reference(&self, record: &FailureRecord) -> Option<String> {
        self.log_base_url.as_ref().map(|base| {
            format!(
                "{}/{}/{}/{}/{}",
                base.trim_end_matches('/'),
                record.graph_id,
                record.run_key,
                record.task,
                record.attempt
            )
        })
    }

    /// Call once per terminally failed task instance. Returns the record that
    /// was delivered.
    pub async fn on_task_failure(&self, mut record: FailureRecord) -> FailureRecord {
        if record.log_reference.is_none() {
            record.log_reference = self.log_reference(&record);
        }

        for notifier in &self.notifiers {
            match contained(notifier.name(), notifier.notify(&record)).await {
                Ok(()) => debug!(notifier = notifier.name(), task = %record.task, "failure notification sent"),
                Err(e) => warn!(
                    notifier = notifier.name(),
                    task = %record.task,
                    run_key = %record.run_key,
                    error = %e,
                    "failure notification not delivered"
                ),
            }
        }

        record
    }

    pub async fn on_run_failure(&self, report: &RunReport) {
        for notifier in &self.notifiers {
            if let Err(e) = contained(notifier.name(), notifier.notify_run(report)).await {
                warn!(
                    notifier = notifier.name(),
                    run_key = %report.run_key,
                    error = %e,
                    "run failure notification not delivered"
                );
            }
        }
    }
}

/// Runs one delivery, turning a panic into a delivery error.
async fn contained<F>(name: &str, delivery: F) -> Result<(), DagError>
where
    F: Future<Output = Result<(), DagError>>,
{
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(DagError::NotificationDelivery(format!("notifier {} panicked", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        mails: Mutex<Vec<(Vec<String>, String, String)>>,
    }

    #[async_trait]
    impl MailTransport for Outbox {
        async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<(), DagError> {
            self.mails
                .lock()
                .unwrap()
                .push((to.to_vec(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Webhook {
        posts: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl WebhookTransport for Webhook {
        async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), DagError> {
            self.posts.lock().unwrap().push((url.to_string(), payload.clone()));
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn notify(&self, _record: &FailureRecord) -> Result<(), DagError> {
            Err(DagError::NotificationDelivery("smtp down".into()))
        }
    }

    fn record() -> FailureRecord {
        FailureRecord::new("etl", RunId::new(), "2024-01-01", "transform", 2, "bad row")
    }

    #[tokio::test]
    async fn email_renders_subject_and_log_reference() {
        let outbox = Arc::new(Outbox::default());
        let mut dispatcher = CallbackDispatcher::new().with_log_base_url("https://logs.local/");
        dispatcher.register(Arc::new(EmailNotifier::new(
            vec!["oncall@example.com".into()],
            outbox.clone(),
        )));

        let delivered = dispatcher.on_task_failure(record()).await;
        assert_eq!(
            delivered.log_reference.as_deref(),
            Some("https://logs.local/etl/2024-01-01/transform/2")
        );

        let mails = outbox.mails.lock().unwrap();
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].1, "Task failed: etl.transform (2024-01-01)");
        assert!(mails[0].2.contains("Error: bad row"));
        assert!(mails[0].2.contains("Log: https://logs.local/etl/2024-01-01/transform/2"));
    }

    #[tokio::test]
    async fn chat_payload_carries_record() {
        let hook = Arc::new(Webhook::default());
        let chat = ChatNotifier::new("https://chat.local/hook", hook.clone());
        chat.notify(&record()).await.unwrap();

        let posts = hook.posts.lock().unwrap();
        assert_eq!(posts[0].0, "https://chat.local/hook");
        assert_eq!(posts[0].1["failure"]["task"], "transform");
        assert!(posts[0].1["text"].as_str().unwrap().contains("attempt 2"));
    }

    #[tokio::test]
    async fn composite_reaches_all_children_and_reports_failures() {
        let outbox = Arc::new(Outbox::default());
        let children: Vec<Arc<dyn Notifier>> = vec![
            Arc::new(Broken),
            Arc::new(NoopNotifier),
            Arc::new(EmailNotifier::new(vec!["a@example.com".into()], outbox.clone())),
        ];
        let composite = CompositeNotifier::new(children);

        let err = composite.notify(&record()).await.unwrap_err();
        assert!(matches!(err, DagError::NotificationDelivery(ref m) if m.starts_with("broken:")));
        assert_eq!(outbox.mails.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatcher_swallows_notifier_errors() {
        let outbox = Arc::new(Outbox::default());
        let mut dispatcher = CallbackDispatcher::new();
        dispatcher.register(Arc::new(Broken));
        dispatcher.register(Arc::new(EmailNotifier::new(vec!["a@example.com".into()], outbox.clone())));

        let delivered = dispatcher.on_task_failure(record()).await;
        assert!(delivered.log_reference.is_none());
        assert_eq!(outbox.mails.lock().unwrap().len(), 1);
    }

    struct Panicky;

    #[async_trait]
    impl Notifier for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn notify(&self, _record: &FailureRecord) -> Result<(), DagError> {
            panic!("webhook client bug");
        }

        async fn notify_run(&self, _report: &RunReport) -> Result<(), DagError> {
            panic!("webhook client bug");
        }
    }

    #[tokio::test]
    async fn panicking_notifier_does_not_stop_the_others() {
        let outbox = Arc::new(Outbox::default());
        let mut dispatcher = CallbackDispatcher::new();
        dispatcher.register(Arc::new(Panicky));
        dispatcher.register(Arc::new(EmailNotifier::new(vec!["a@example.com".into()], outbox.clone())));

        let delivered = dispatcher.on_task_failure(record()).await;
        assert_eq!(delivered.task, "transform");
        assert_eq!(outbox.mails.lock().unwrap().len(), 1);

        let err = contained("panicky", Panicky.notify(&record())).await.unwrap_err();
        assert!(matches!(err, DagError::NotificationDelivery(ref m) if m.contains("panicky")));
    }
}
