use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DagError, Graph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Skipped)
    }

    fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Skipped)
                | (Queued, Running)
                | (Queued, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Skipped)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Why an instance was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// `task` is the upstream task whose terminal failure caused the skip.
    UpstreamFailed { task: String },
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed { task } => write!(f, "upstream task '{}' failed", task),
            SkipReason::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// Per-run execution record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task: String,
    pub state: TaskState,
    pub attempt: u32,
    /// Attempt numbers that actually started executing.
    pub attempts: Vec<u32>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub skip_reason: Option<SkipReason>,
    #[serde(skip)]
    pub(crate) retry_at: Option<tokio::time::Instant>,
}

impl TaskInstance {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            state: TaskState::Pending,
            attempt: 0,
            attempts: Vec::new(),
            last_error: None,
            started_at: None,
            ended_at: None,
            skip_reason: None,
            retry_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: TaskState) -> Result<(), DagError> {
        if !self.state.can_transition_to(to) {
            return Err(DagError::InvalidTransition {
                task: self.task.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn mark_queued(&mut self) -> Result<(), DagError> {
        self.transition(TaskState::Queued)
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), DagError> {
        self.transition(TaskState::Running)?;
        self.retry_at = None;
        self.attempts.push(self.attempt);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn mark_succeeded(&mut self) -> Result<(), DagError> {
        self.transition(TaskState::Succeeded)
    }

    /// Back to `QUEUED` for the next attempt, not dispatchable before `retry_at`.
    pub(crate) fn requeue(
        &mut self,
        error: String,
        retry_at: tokio::time::Instant,
    ) -> Result<(), DagError> {
        self.transition(TaskState::Queued)?;
        self.last_error = Some(error);
        self.attempt += 1;
        self.retry_at = Some(retry_at);
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: String) -> Result<(), DagError> {
        self.transition(TaskState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    pub(crate) fn mark_skipped(&mut self, reason: SkipReason) -> Result<(), DagError> {
        self.transition(TaskState::Skipped)?;
        self.retry_at = None;
        self.skip_reason = Some(reason);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One execution of a graph. Instances are kept in the graph's topological order.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub run_key: String,
    pub graph_id: String,
    pub logical_date: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    instances: Vec<TaskInstance>,
    index: HashMap<String, usize>,
}

impl Run {
    pub fn new(graph: &Graph, run_key: impl Into<String>, logical_date: DateTime<Utc>) -> Self {
        let instances: Vec<TaskInstance> = graph
            .topological_order()
            .iter()
            .map(TaskInstance::new)
            .collect();
        let index = instances
            .iter()
            .enumerate()
            .map(|(pos, inst)| (inst.task.clone(), pos))
            .collect();

        Self {
            id: RunId::new(),
            run_key: run_key.into(),
            graph_id: graph.id().to_string(),
            logical_date,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            cancelled: false,
            instances,
            index,
        }
    }

    pub fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    pub(crate) fn instances_mut(&mut self) -> &mut [TaskInstance] {
        &mut self.instances
    }

    pub fn instance(&self, task: &str) -> Option<&TaskInstance> {
        self.index.get(task).map(|&pos| &self.instances[pos])
    }

    pub(crate) fn instance_mut(&mut self, task: &str) -> Option<&mut TaskInstance> {
        match self.index.get(task) {
            Some(&pos) => Some(&mut self.instances[pos]),
            None => None,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.instances.iter().all(TaskInstance::is_terminal)
    }

    /// Computes the terminal status once every instance is terminal.
    pub(crate) fn finish(&mut self) -> RunStatus {
        let any_failed = self
            .instances
            .iter()
            .any(|inst| inst.state == TaskState::Failed);
        self.status = if any_failed {
            RunStatus::Failed
        } else if self.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };
        self.ended_at = Some(Utc::now());
        self.status
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.id,
            run_key: self.run_key.clone(),
            graph_id: self.graph_id.clone(),
            logical_date: self.logical_date,
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            tasks: self.instances.clone(),
        }
    }
}

/// Inspectable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub run_key: String,
    pub graph_id: String,
    pub logical_date: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskInstance>,
}

impl RunReport {
    pub fn task(&self, name: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|t| t.task == name)
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.task(name).map(|t| t.state)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskInstance> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }

    pub fn skipped_tasks(&self) -> impl Iterator<Item = &TaskInstance> {
        self.tasks.iter().filter(|t| t.state == TaskState::Skipped)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} ({} / {}): {}",
            self.run_id, self.graph_id, self.run_key, self.status
        )?;
        for task in &self.tasks {
            write!(f, "  {}: {} (attempt {})", task.task, task.state, task.attempt)?;
            match (&task.state, &task.last_error, &task.skip_reason) {
                (TaskState::Failed, Some(err), _) => write!(f, " - {}", err)?,
                (TaskState::Skipped, _, Some(reason)) => write!(f, " - {}", reason)?,
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
