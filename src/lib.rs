pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod graph;
pub mod relay;
pub mod run;
pub mod executor;
pub mod callback;
pub mod scheduler;
pub mod config;
pub mod logging;

pub use task::{ExecutionContext, FnUnit, NoopUnit, TaskDefinition, UnitOfWork, merge_params};
pub use retry::{BackoffPolicy, ConstantBackoff, ExponentialBackoff, RetryManager};
pub use cycle_check::find_cycle;
pub use graph::{Graph, GraphBuilder, GraphError};
pub use relay::{BlobStore, InMemoryBlobStore, RelayError, RelayKey, RelayReader, RelayStore, RelayWrites};
pub use run::{Run, RunId, RunReport, RunStatus, SkipReason, TaskInstance, TaskState};
pub use executor::{Outcome, TaskExecutor};
pub use callback::{
    CallbackDispatcher, ChatNotifier, CompositeNotifier, EmailNotifier, FailureRecord,
    MailTransport, NoopNotifier, Notifier, WebhookTransport,
};
pub use scheduler::{RunHandle, Scheduler, TriggerRequest};
pub use config::DagrelayConfig;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Params = HashMap<String, serde_json::Value>;
pub type ParamsOverride = HashMap<String, Params>;
pub type BoxUnit = Arc<dyn UnitOfWork>;

#[derive(Error, Debug)]
pub enum DagError {
    #[error("Graph definition error: {0}")]
    GraphDefinition(#[from] GraphError),
    #[error("Relay write conflict: {0}")]
    RelayWriteConflict(RelayError),
    #[error("Relay entry not found: {0}")]
    RelayNotFound(RelayError),
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),
    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("Unknown task '{0}'")]
    UnknownTask(String),
    #[error("Run for key '{0}' already exists")]
    DuplicateRun(String),
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },
    #[error("Blob store error: {0}")]
    Blob(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DagError {
    /// Whether a task attempt that failed with this error may be retried.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            DagError::GraphDefinition(_)
                | DagError::RelayWriteConflict(_)
                | DagError::InvalidTransition { .. }
                | DagError::ContextCancelled(_)
                | DagError::Internal(_)
        )
    }
}

impl From<RelayError> for DagError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::DuplicateWrite(_) => DagError::RelayWriteConflict(err),
            RelayError::NotFound(_) | RelayError::NotUpstream { .. } => {
                DagError::RelayNotFound(err)
            }
        }
    }
}
