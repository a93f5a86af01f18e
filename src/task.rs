use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{BackoffPolicy, BlobStore, BoxUnit, DagError, Params, RelayReader, RelayWrites, RunId};

/// The executable logic behind one task.
///
/// `run` returns the relay entries the task wants to publish. The hooks run
/// around it on every attempt; an error from any of them fails the attempt.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn pre_execution(&self, _ctx: &ExecutionContext) -> Result<(), DagError> {
        Ok(())
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError>;

    async fn post_execution(
        &self,
        _ctx: &ExecutionContext,
        _writes: &RelayWrites,
    ) -> Result<(), DagError> {
        Ok(())
    }
}

/// Placeholder unit that succeeds without writing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUnit;

#[async_trait]
impl UnitOfWork for NoopUnit {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
        Ok(RelayWrites::new())
    }
}

/// Adapts a synchronous closure into a [`UnitOfWork`].
pub struct FnUnit<F> {
    func: F,
}

impl<F> FnUnit<F>
where
    F: Fn(&ExecutionContext) -> Result<RelayWrites, DagError> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }

    pub fn boxed(func: F) -> BoxUnit {
        Arc::new(Self::new(func))
    }
}

#[async_trait]
impl<F> UnitOfWork for FnUnit<F>
where
    F: Fn(&ExecutionContext) -> Result<RelayWrites, DagError> + Send + Sync + 'static,
{
    async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
        (self.func)(ctx)
    }
}

/// Static description of one workflow step.
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    unit: BoxUnit,
    params: Params,
    max_retries: u32,
    retry_delay: Duration,
    execution_timeout: Option<Duration>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, unit: BoxUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            params: Params::new(),
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            execution_timeout: None,
            backoff: None,
        }
    }

    /// A definition backed by [`NoopUnit`], for structural tasks like `start`/`end`.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(NoopUnit))
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Overrides the scheduler-wide backoff policy for this task only.
    pub fn with_backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &BoxUnit {
        &self.unit
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout
    }

    pub fn backoff(&self) -> Option<&Arc<dyn BackoffPolicy>> {
        self.backoff.as_ref()
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("execution_timeout", &self.execution_timeout)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Merges per-run parameters over definition defaults. Per-run values win.
pub fn merge_params(defaults: &Params, overrides: Option<&Params>) -> Params {
    let mut merged = defaults.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Everything a unit of work can see while it runs.
pub struct ExecutionContext {
    pub run_id: RunId,
    pub run_key: String,
    pub logical_date: DateTime<Utc>,
    pub task_name: String,
    pub attempt: u32,
    pub params: Params,
    relay: RelayReader,
    blobs: Option<Arc<dyn BlobStore>>,
    cancel: CancellationToken,
}

/// Which run, task and attempt a context belongs to.
#[derive(Debug, Clone)]
pub(crate) struct AttemptScope {
    pub run_id: RunId,
    pub run_key: String,
    pub logical_date: DateTime<Utc>,
    pub task_name: String,
    pub attempt: u32,
}

impl ExecutionContext {
    pub(crate) fn new(
        scope: AttemptScope,
        params: Params,
        relay: RelayReader,
        blobs: Option<Arc<dyn BlobStore>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: scope.run_id,
            run_key: scope.run_key,
            logical_date: scope.logical_date,
            task_name: scope.task_name,
            attempt: scope.attempt,
            params,
            relay,
            blobs,
            cancel,
        }
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    /// Reads a relay entry published by an upstream task of this run.
    pub async fn relay_get(
        &self,
        producer: &str,
        key: &str,
    ) -> Result<serde_json::Value, DagError> {
        self.relay.get(producer, key).await.map_err(DagError::from)
    }

    /// Tasks whose relay entries this task may read.
    pub fn upstream(&self) -> &HashSet<String> {
        self.relay.upstream()
    }

    pub fn blob_store(&self) -> Option<&Arc<dyn BlobStore>> {
        self.blobs.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(ContextCancelled)` once the run has been cancelled. Long units
    /// can call this between steps.
    pub fn check_cancelled(&self) -> Result<(), DagError> {
        if self.cancel.is_cancelled() {
            return Err(DagError::ContextCancelled(format!(
                "run {} cancelled while {} was running",
                self.run_key, self.task_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn per_run_params_take_precedence() {
        let defaults: Params = [
            ("source".to_string(), json!("s3://raw")),
            ("batch".to_string(), json!(100)),
        ]
        .into_iter()
        .collect();
        let overrides: Params = [("batch".to_string(), json!(500))].into_iter().collect();

        let merged = merge_params(&defaults, Some(&overrides));
        assert_eq!(merged["source"], json!("s3://raw"));
        assert_eq!(merged["batch"], json!(500));

        let untouched = merge_params(&defaults, None);
        assert_eq!(untouched, defaults);
    }

    #[test]
    fn definition_builder_sets_retry_settings() {
        let def = TaskDefinition::noop("extract")
            .with_param("table", json!("orders"))
            .with_retries(2, Duration::from_millis(5))
            .with_timeout(Duration::from_secs(3));

        assert_eq!(def.name(), "extract");
        assert_eq!(def.max_retries(), 2);
        assert_eq!(def.retry_delay(), Duration::from_millis(5));
        assert_eq!(def.execution_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(def.params()["table"], json!("orders"));
        assert!(def.backoff().is_none());
    }
}
