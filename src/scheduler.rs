//! Drives one run of a graph to a terminal state.
//!
//! Each triggered run gets its own driver task. The driver is the only code
//! that changes task instance states: units of work run on spawned tasks and
//! report back over a completion channel, so every transition is a single
//! decision made in one place. Observers read published snapshots.
//! Failure notifications are delivered on their own tasks so a slow notifier
//! never holds up dispatching.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task::AttemptScope;
use crate::{
    BlobStore, CallbackDispatcher, DagError, DagrelayConfig, ExecutionContext, FailureRecord,
    Graph, Notifier, Outcome, Params, ParamsOverride, RelayReader, RelayStore, RetryManager, Run,
    RunId, RunReport, RunStatus, SkipReason, TaskDefinition, TaskExecutor, TaskState,
    merge_params,
};

const DEFAULT_MAX_CONCURRENT_TASKS: usize = 16;

/// Request to run the graph for one logical run key.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub run_key: String,
    pub logical_date: DateTime<Utc>,
    /// Task name -> parameters merged over that task's defaults.
    pub params_override: ParamsOverride,
}

impl TriggerRequest {
    pub fn new(run_key: impl Into<String>, logical_date: DateTime<Utc>) -> Self {
        Self {
            run_key: run_key.into(),
            logical_date,
            params_override: ParamsOverride::new(),
        }
    }

    /// Keyed by the calendar date, as a daily clock would trigger it.
    pub fn for_date(logical_date: DateTime<Utc>) -> Self {
        Self::new(logical_date.format("%Y-%m-%d").to_string(), logical_date)
    }

    pub fn manual() -> Self {
        let now = Utc::now();
        Self::new(format!("manual__{}", now.to_rfc3339()), now)
    }

    pub fn with_params(mut self, task: impl Into<String>, params: Params) -> Self {
        self.params_override.entry(task.into()).or_default().extend(params);
        self
    }
}

pub struct Scheduler {
    graph: Arc<Graph>,
    relay: Arc<RelayStore>,
    retry: RetryManager,
    callbacks: CallbackDispatcher,
    blobs: Option<Arc<dyn BlobStore>>,
    executor: TaskExecutor,
    max_concurrent_tasks: usize,
    runs: Arc<Mutex<HashMap<String, RunStatus>>>,
}

impl Scheduler {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            relay: Arc::new(RelayStore::new()),
            retry: RetryManager::default(),
            callbacks: CallbackDispatcher::new(),
            blobs: None,
            executor: TaskExecutor::new(),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(graph: Arc<Graph>, config: &DagrelayConfig) -> Self {
        let mut callbacks = CallbackDispatcher::new();
        if let Some(url) = &config.notifications.log_base_url {
            callbacks = callbacks.with_log_base_url(url.clone());
        }

        Self::new(graph)
            .with_retry_manager(config.retry_manager())
            .with_max_concurrent_tasks(config.scheduler.max_concurrent_tasks)
            .with_callbacks(callbacks)
    }

    pub fn with_relay_store(mut self, relay: Arc<RelayStore>) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_retry_manager(mut self, retry: RetryManager) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackDispatcher) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.callbacks.register(notifier);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = limit.max(1);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn relay_store(&self) -> &Arc<RelayStore> {
        &self.relay
    }

    /// Status of the latest run for `run_key`, if any was triggered.
    pub async fn run_status(&self, run_key: &str) -> Option<RunStatus> {
        self.runs.lock().await.get(run_key).copied()
    }

    /// Starts a run in the background.
    ///
    /// A run key whose latest run is still running or has succeeded is
    /// rejected with [`DagError::DuplicateRun`]. A key whose latest run failed
    /// or was cancelled starts over: its relay entries are dropped first.
    pub async fn trigger_run(&self, request: TriggerRequest) -> Result<RunHandle, DagError> {
        if let Some(unknown) = request
            .params_override
            .keys()
            .find(|task| !self.graph.contains(task))
        {
            return Err(DagError::UnknownTask(unknown.clone()));
        }

        {
            let mut runs = self.runs.lock().await;
            match runs.get(&request.run_key) {
                Some(RunStatus::Running) | Some(RunStatus::Succeeded) => {
                    return Err(DagError::DuplicateRun(request.run_key));
                }
                Some(previous) => {
                    let purged = self.relay.purge_run(&request.run_key).await;
                    info!(
                        run_key = %request.run_key,
                        previous = %previous,
                        purged,
                        "re-triggering run"
                    );
                }
                None => {}
            }
            runs.insert(request.run_key.clone(), RunStatus::Running);
        }

        let run = Run::new(&self.graph, &request.run_key, request.logical_date);
        let run_id = run.id;
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(run.report());

        let driver = RunDriver {
            graph: Arc::clone(&self.graph),
            relay: Arc::clone(&self.relay),
            retry: self.retry.clone(),
            callbacks: self.callbacks.clone(),
            blobs: self.blobs.clone(),
            executor: self.executor,
            semaphore: Arc::new(Semaphore::new(self.max_concurrent_tasks)),
            run,
            params_override: request.params_override,
            cancel: cancel.clone(),
            snapshot_tx,
            runs: Arc::clone(&self.runs),
            deliveries: JoinSet::new(),
        };
        let runs = Arc::clone(&self.runs);
        let run_key = request.run_key.clone();
        let join = tokio::spawn(async move {
            match AssertUnwindSafe(driver.drive()).catch_unwind().await {
                Ok(report) => Ok(report),
                Err(_) => {
                    // 驱动崩溃也要释放运行键
                    error!(run_key = %run_key, "run driver panicked");
                    runs.lock().await.insert(run_key.clone(), RunStatus::Failed);
                    Err(DagError::Internal(format!("run driver for '{}' panicked", run_key)))
                }
            }
        });

        Ok(RunHandle {
            run_id,
            run_key: request.run_key,
            cancel,
            snapshot: snapshot_rx,
            join,
        })
    }

    /// Triggers a run and waits for it to finish.
    pub async fn run(&self, request: TriggerRequest) -> Result<RunReport, DagError> {
        self.trigger_run(request).await?.wait().await
    }

    /// Drops everything kept for a finished run key: its registry entry and
    /// its relay entries. Without this both grow by one key per run. Returns
    /// the number of relay entries removed. A run still in flight is rejected
    /// with [`DagError::DuplicateRun`].
    pub async fn forget_run(&self, run_key: &str) -> Result<usize, DagError> {
        let mut runs = self.runs.lock().await;
        if runs.get(run_key) == Some(&RunStatus::Running) {
            return Err(DagError::DuplicateRun(run_key.to_string()));
        }
        runs.remove(run_key);
        let purged = self.relay.purge_run(run_key).await;
        debug!(run_key, purged, "run forgotten");
        Ok(purged)
    }
}

/// Handle to a run in flight.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    run_key: String,
    cancel: CancellationToken,
    snapshot: watch::Receiver<RunReport>,
    join: JoinHandle<Result<RunReport, DagError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    /// Requests cancellation. Observed at the driver's next tick.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> RunReport {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RunReport> {
        self.snapshot.clone()
    }

    /// Waits for the final report. Failure notifications for the run have
    /// been delivered (or given up on) by the time this returns.
    pub async fn wait(self) -> Result<RunReport, DagError> {
        self.join
            .await
            .map_err(|e| DagError::Internal(format!("run driver join error: {}", e)))?
    }
}

struct Completion {
    task: String,
    attempt: u32,
    outcome: Outcome,
}

struct RunDriver {
    graph: Arc<Graph>,
    relay: Arc<RelayStore>,
    retry: RetryManager,
    callbacks: CallbackDispatcher,
    blobs: Option<Arc<dyn BlobStore>>,
    executor: TaskExecutor,
    semaphore: Arc<Semaphore>,
    run: Run,
    params_override: ParamsOverride,
    cancel: CancellationToken,
    snapshot_tx: watch::Sender<RunReport>,
    runs: Arc<Mutex<HashMap<String, RunStatus>>>,
    deliveries: JoinSet<()>,
}

impl RunDriver {
    async fn drive(mut self) -> RunReport {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
        let cancel = self.cancel.clone();
        let mut in_flight = 0usize;
        let mut cancelled = false;

        info!(
            graph = %self.run.graph_id,
            run_key = %self.run.run_key,
            run_id = %self.run.id,
            "run started"
        );

        loop {
            if !cancelled && cancel.is_cancelled() {
                self.apply_cancel();
                cancelled = true;
            }
            if !cancelled {
                self.promote_pending();
                in_flight += self.dispatch_ready(&completion_tx);
            }
            self.publish();

            if in_flight == 0 && self.run.all_terminal() {
                break;
            }

            let next_retry = self.next_retry_at();
            let has_permits = self.semaphore.available_permits() > 0;
            tokio::select! {
                // 处理任务完成
                Some(done) = completion_rx.recv() => {
                    in_flight -= 1;
                    self.handle_completion(done).await;
                }

                // 退避结束，重新派发
                _ = sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() && has_permits => {}

                // 检查取消
                _ = cancel.cancelled(), if !cancelled => {}
            }
        }

        self.finish().await
    }

    /// PENDING instances become QUEUED once all upstream succeeded, or SKIPPED
    /// as soon as one upstream failed or was skipped. Instances are visited in
    /// topological order, so skips propagate through the whole subgraph in
    /// one pass.
    fn promote_pending(&mut self) {
        for pos in 0..self.run.instances().len() {
            let inst = &self.run.instances()[pos];
            if inst.state != TaskState::Pending {
                continue;
            }
            let name = inst.task.clone();

            let mut all_succeeded = true;
            let mut blocked_by: Option<String> = None;
            for parent in self.graph.predecessors(&name) {
                let Some(up) = self.run.instance(parent) else {
                    continue;
                };
                match up.state {
                    TaskState::Succeeded => {}
                    TaskState::Failed => {
                        blocked_by = Some(parent.clone());
                        break;
                    }
                    TaskState::Skipped => {
                        blocked_by = Some(match &up.skip_reason {
                            Some(SkipReason::UpstreamFailed { task }) => task.clone(),
                            _ => parent.clone(),
                        });
                        break;
                    }
                    _ => all_succeeded = false,
                }
            }

            let inst = &mut self.run.instances_mut()[pos];
            let result = match blocked_by {
                Some(root) => {
                    info!(task = %name, upstream = %root, "task skipped");
                    inst.mark_skipped(SkipReason::UpstreamFailed { task: root })
                }
                None if all_succeeded => {
                    debug!(task = %name, "task queued");
                    inst.mark_queued()
                }
                None => Ok(()),
            };
            if let Err(e) = result {
                error!(task = %name, error = %e, "state update rejected");
            }
        }
    }

    /// Starts QUEUED instances in topological order while permits remain.
    fn dispatch_ready(&mut self, completion_tx: &mpsc::UnboundedSender<Completion>) -> usize {
        let now = Instant::now();
        let mut launched = 0;

        for pos in 0..self.run.instances().len() {
            let inst = &self.run.instances()[pos];
            if inst.state != TaskState::Queued || inst.retry_at.is_some_and(|at| at > now) {
                continue;
            }
            let name = inst.task.clone();
            let attempt = inst.attempt;

            let Some(task) = self.graph.task(&name).cloned() else {
                continue;
            };
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if let Err(e) = self.run.instances_mut()[pos].mark_running() {
                error!(task = %name, error = %e, "state update rejected");
                continue;
            }

            info!(task = %name, attempt, "task running");
            let ctx = self.context_for(&task, attempt);
            let executor = self.executor;
            let tx = completion_tx.clone();

            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(executor.execute(&task, &ctx))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Failed(DagError::TaskExecution("task panicked".to_string())),
                };
                // 先释放并发许可，再通知完成
                drop(permit);
                let _ = tx.send(Completion {
                    task: name,
                    attempt,
                    outcome,
                });
            });
            launched += 1;
        }

        launched
    }

    fn context_for(&self, task: &TaskDefinition, attempt: u32) -> ExecutionContext {
        let upstream = self
            .graph
            .ancestors(task.name())
            .cloned()
            .unwrap_or_default();
        let reader = RelayReader::new(
            Arc::clone(&self.relay),
            self.run.run_key.clone(),
            task.name(),
            Arc::new(upstream),
        );

        let scope = AttemptScope {
            run_id: self.run.id,
            run_key: self.run.run_key.clone(),
            logical_date: self.run.logical_date,
            task_name: task.name().to_string(),
            attempt,
        };
        ExecutionContext::new(
            scope,
            merge_params(task.params(), self.params_override.get(task.name())),
            reader,
            self.blobs.clone(),
            self.cancel.child_token(),
        )
    }

    async fn handle_completion(&mut self, done: Completion) {
        let Completion {
            task,
            attempt,
            outcome,
        } = done;

        let still_running = self
            .run
            .instance(&task)
            .is_some_and(|inst| inst.state == TaskState::Running);
        if !still_running {
            debug!(task = %task, attempt, "discarding result of cancelled task");
            return;
        }

        let failure = match outcome {
            Outcome::Succeeded(writes) => {
                match self.relay.put_all(&self.run.run_key, &task, &writes).await {
                    Ok(()) => {
                        if let Some(inst) = self.run.instance_mut(&task) {
                            if let Err(e) = inst.mark_succeeded() {
                                error!(task = %task, error = %e, "state update rejected");
                            }
                        }
                        info!(task = %task, attempt, writes = writes.len(), "task succeeded");
                        return;
                    }
                    Err(e) => DagError::from(e),
                }
            }
            Outcome::Failed(e) => e,
        };

        self.handle_failure(&task, attempt, failure);
    }

    fn handle_failure(&mut self, task: &str, attempt: u32, err: DagError) {
        let Some(def) = self.graph.task(task) else {
            return;
        };
        let next = attempt + 1;
        let message = err.to_string();

        if err.is_retriable() && self.retry.should_retry(next, def.max_retries()) {
            let delay = self.retry.backoff_for(def, next);
            warn!(task, attempt, retry_in = ?delay, error = %message, "task failed, will retry");
            if let Some(inst) = self.run.instance_mut(task) {
                if let Err(e) = inst.requeue(message, Instant::now() + delay) {
                    error!(task, error = %e, "state update rejected");
                }
            }
            return;
        }

        error!(task, attempt, error = %message, "task failed");
        if let Some(inst) = self.run.instance_mut(task) {
            if let Err(e) = inst.mark_failed(message.clone()) {
                error!(task, error = %e, "state update rejected");
                return;
            }
        }

        let record = FailureRecord::new(
            &self.run.graph_id,
            self.run.id,
            &self.run.run_key,
            task,
            attempt,
            message,
        );
        let callbacks = self.callbacks.clone();
        self.deliveries.spawn(async move {
            callbacks.on_task_failure(record).await;
        });
    }

    fn apply_cancel(&mut self) {
        self.run.cancelled = true;
        let mut skipped = 0;
        for inst in self.run.instances_mut() {
            if inst.is_terminal() {
                continue;
            }
            match inst.mark_skipped(SkipReason::Cancelled) {
                Ok(()) => skipped += 1,
                Err(e) => error!(task = %inst.task, error = %e, "state update rejected"),
            }
        }
        info!(run_key = %self.run.run_key, skipped, "run cancelled");
    }

    /// Earliest backoff deadline among QUEUED instances. A deadline already in
    /// the past wakes the loop at once so the instance gets dispatched.
    fn next_retry_at(&self) -> Option<Instant> {
        self.run
            .instances()
            .iter()
            .filter(|inst| inst.state == TaskState::Queued)
            .filter_map(|inst| inst.retry_at)
            .min()
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.run.report());
    }

    async fn finish(mut self) -> RunReport {
        let status = self.run.finish();
        let report = self.run.report();

        match status {
            RunStatus::Failed => {
                let failed: Vec<&str> = report.failed_tasks().map(|t| t.task.as_str()).collect();
                error!(
                    run_key = %report.run_key,
                    failed = ?failed,
                    "run failed"
                );
                let callbacks = self.callbacks.clone();
                let failed_run = report.clone();
                self.deliveries.spawn(async move {
                    callbacks.on_run_failure(&failed_run).await;
                });
            }
            _ => info!(run_key = %report.run_key, status = %status, "run finished"),
        }

        self.runs
            .lock()
            .await
            .insert(self.run.run_key.clone(), status);
        self.snapshot_tx.send_replace(report.clone());

        // 等待未完成的通知
        while let Some(joined) = self.deliveries.join_next().await {
            if let Err(e) = joined {
                warn!(run_key = %report.run_key, error = %e, "notification task did not finish");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnUnit, GraphBuilder, RelayWrites};
    use serde_json::json;

    fn chain(names: &[&str]) -> Arc<Graph> {
        let mut builder = GraphBuilder::new("test");
        for name in names {
            builder = builder.task(TaskDefinition::noop(*name));
        }
        Arc::new(builder.chain(names).build().unwrap())
    }

    #[tokio::test]
    async fn empty_graph_succeeds_immediately() {
        let graph = Arc::new(GraphBuilder::new("empty").build().unwrap());
        let report = Scheduler::new(graph)
            .run(TriggerRequest::new("r", Utc::now()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.tasks.is_empty());
    }

    #[tokio::test]
    async fn rejects_retrigger_of_succeeded_run() {
        let scheduler = Scheduler::new(chain(&["a", "b"]));
        let report = scheduler.run(TriggerRequest::new("2024-01-01", Utc::now())).await.unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(scheduler.run_status("2024-01-01").await, Some(RunStatus::Succeeded));

        let err = scheduler
            .trigger_run(TriggerRequest::new("2024-01-01", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DagError::DuplicateRun(ref key) if key == "2024-01-01"));
    }

    #[tokio::test]
    async fn rejects_override_for_unknown_task() {
        let scheduler = Scheduler::new(chain(&["a"]));
        let request = TriggerRequest::new("r", Utc::now()).with_params("ghost", Params::new());
        assert!(matches!(
            scheduler.trigger_run(request).await,
            Err(DagError::UnknownTask(ref t)) if t == "ghost"
        ));
        assert_eq!(scheduler.run_status("r").await, None);
    }

    #[tokio::test]
    async fn failed_run_can_be_retriggered_with_fresh_relay() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let graph = GraphBuilder::new("flaky")
            .task(TaskDefinition::new(
                "produce",
                FnUnit::boxed(|_| Ok(RelayWrites::new().with("v", json!(1)))),
            ))
            .task(TaskDefinition::new(
                "consume",
                FnUnit::boxed(move |_| {
                    if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(DagError::TaskExecution("first run breaks".into()))
                    } else {
                        Ok(RelayWrites::new())
                    }
                }),
            ))
            .chain(&["produce", "consume"])
            .build()
            .unwrap();
        let scheduler = Scheduler::new(Arc::new(graph));

        let first = scheduler.run(TriggerRequest::new("k", Utc::now())).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);

        let second = scheduler.run(TriggerRequest::new("k", Utc::now())).await.unwrap();
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn snapshots_are_published() {
        let scheduler = Scheduler::new(chain(&["a", "b", "c"]));
        let handle = scheduler.trigger_run(TriggerRequest::manual()).await.unwrap();
        let mut rx = handle.subscribe();
        let report = handle.wait().await.unwrap();

        let last = rx.borrow_and_update().clone();
        assert_eq!(last, report);
        assert!(last.tasks.iter().all(|t| t.state == TaskState::Succeeded));
    }

    #[tokio::test]
    async fn max_concurrency_clamps_to_one() {
        let scheduler = Scheduler::new(chain(&["a"])).with_max_concurrent_tasks(0);
        assert_eq!(scheduler.max_concurrent_tasks, 1);
        let report = scheduler
            .run(TriggerRequest::for_date(Utc::now()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn forget_run_drops_registry_and_relay_entries() {
        let graph = GraphBuilder::new("forget")
            .task(TaskDefinition::new(
                "produce",
                FnUnit::boxed(|_| Ok(RelayWrites::new().with("a", json!(1)).with("b", json!(2)))),
            ))
            .build()
            .unwrap();
        let scheduler = Scheduler::new(Arc::new(graph));

        scheduler.run(TriggerRequest::new("2024-01-02", Utc::now())).await.unwrap();
        assert_eq!(scheduler.relay_store().len().await, 2);

        assert_eq!(scheduler.forget_run("2024-01-02").await.unwrap(), 2);
        assert_eq!(scheduler.run_status("2024-01-02").await, None);
        assert!(scheduler.relay_store().is_empty().await);

        // the key is free again
        let again = scheduler.run(TriggerRequest::new("2024-01-02", Utc::now())).await.unwrap();
        assert_eq!(again.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn forget_run_rejects_run_in_flight() {
        let graph = GraphBuilder::new("slow")
            .task(TaskDefinition::new(
                "wait",
                FnUnit::boxed(|_| Ok(RelayWrites::new())),
            ))
            .build()
            .unwrap();
        let scheduler = Scheduler::new(Arc::new(graph));
        scheduler.runs.lock().await.insert("busy".to_string(), RunStatus::Running);

        assert!(matches!(
            scheduler.forget_run("busy").await,
            Err(DagError::DuplicateRun(ref key)) if key == "busy"
        ));
        assert_eq!(scheduler.run_status("busy").await, Some(RunStatus::Running));
    }
}
