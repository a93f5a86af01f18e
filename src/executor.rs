use tokio::time::timeout;
use tracing::debug;

use crate::{DagError, ExecutionContext, RelayError, RelayKey, RelayWrites, TaskDefinition};

/// Result of one attempt.
#[derive(Debug)]
pub enum Outcome {
    Succeeded(RelayWrites),
    Failed(DagError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }
}

/// Runs a single attempt of a task. Retry decisions belong to the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, task: &TaskDefinition, ctx: &ExecutionContext) -> Outcome {
        debug!(
            run_key = %ctx.run_key,
            task = %ctx.task_name,
            attempt = ctx.attempt,
            "executing task"
        );

        let attempt = async {
            match task.execution_timeout() {
                Some(limit) => match timeout(limit, Self::run_hooks(task, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(DagError::TaskTimeout(limit)),
                },
                None => Self::run_hooks(task, ctx).await,
            }
        };

        // 取消优先于任务结果
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(DagError::ContextCancelled(format!(
                "{} interrupted by run cancellation",
                ctx.task_name
            ))),
            result = attempt => result,
        };

        match result {
            Ok(writes) => {
                if let Some(key) = writes.duplicate_key() {
                    return Outcome::Failed(DagError::RelayWriteConflict(
                        RelayError::DuplicateWrite(RelayKey::new(
                            ctx.run_key.clone(),
                            ctx.task_name.clone(),
                            key,
                        )),
                    ));
                }
                Outcome::Succeeded(writes)
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn run_hooks(
        task: &TaskDefinition,
        ctx: &ExecutionContext,
    ) -> Result<RelayWrites, DagError> {
        let unit = task.unit();

        // PreExecution
        unit.pre_execution(ctx).await?;

        // Execute
        let writes = unit.run(ctx).await?;

        // PostExecution
        unit.post_execution(ctx, &writes).await?;

        Ok(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AttemptScope;
    use crate::{FnUnit, RelayReader, RelayStore, RunId, UnitOfWork};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn context(task: &str, params: crate::Params) -> ExecutionContext {
        context_with_token(task, params, CancellationToken::new())
    }

    fn context_with_token(
        task: &str,
        params: crate::Params,
        cancel: CancellationToken,
    ) -> ExecutionContext {
        let reader = RelayReader::new(
            Arc::new(RelayStore::new()),
            "2024-01-01",
            task,
            Arc::new(HashSet::new()),
        );
        let scope = AttemptScope {
            run_id: RunId::new(),
            run_key: "2024-01-01".into(),
            logical_date: Utc::now(),
            task_name: task.into(),
            attempt: 0,
        };
        ExecutionContext::new(scope, params, reader, None, cancel)
    }

    #[tokio::test]
    async fn success_returns_writes() {
        let def = TaskDefinition::new(
            "extract",
            FnUnit::boxed(|ctx| {
                let table = ctx.param("table").cloned().unwrap_or(json!(null));
                Ok(RelayWrites::new().with("table", table))
            }),
        );
        let params = [("table".to_string(), json!("orders"))].into_iter().collect();

        match TaskExecutor::new().execute(&def, &context("extract", params)).await {
            Outcome::Succeeded(writes) => {
                assert_eq!(writes.iter().next(), Some(("table", &json!("orders"))));
            }
            Outcome::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_attempt_conflict() {
        let def = TaskDefinition::new(
            "extract",
            FnUnit::boxed(|_| Ok(RelayWrites::new().with("k", json!(1)).with("k", json!(2)))),
        );
        let outcome = TaskExecutor::new().execute(&def, &context("extract", Default::default())).await;
        assert!(matches!(outcome, Outcome::Failed(DagError::RelayWriteConflict(_))));
    }

    struct Hooked {
        calls: Arc<AtomicU32>,
        fail_post: bool,
    }

    #[async_trait]
    impl UnitOfWork for Hooked {
        async fn pre_execution(&self, _ctx: &ExecutionContext) -> Result<(), DagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(&self, _ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
            self.calls.fetch_add(10, Ordering::SeqCst);
            Ok(RelayWrites::new())
        }

        async fn post_execution(
            &self,
            _ctx: &ExecutionContext,
            _writes: &RelayWrites,
        ) -> Result<(), DagError> {
            self.calls.fetch_add(100, Ordering::SeqCst);
            if self.fail_post {
                return Err(DagError::TaskExecution("post hook failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_around_unit_and_can_fail_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let def = TaskDefinition::new(
            "load",
            Arc::new(Hooked { calls: Arc::clone(&calls), fail_post: true }),
        );
        let outcome = TaskExecutor::new().execute(&def, &context("load", Default::default())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 111);
        assert!(matches!(outcome, Outcome::Failed(DagError::TaskExecution(_))));
    }

    struct Slow;

    #[async_trait]
    impl UnitOfWork for Slow {
        async fn run(&self, _ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RelayWrites::new())
        }
    }

    #[tokio::test]
    async fn timeout_fails_attempt() {
        let def = TaskDefinition::new("slow", Arc::new(Slow)).with_timeout(Duration::from_millis(10));
        let outcome = TaskExecutor::new().execute(&def, &context("slow", Default::default())).await;
        assert!(matches!(outcome, Outcome::Failed(DagError::TaskTimeout(_))));
    }

    struct Steps;

    #[async_trait]
    impl UnitOfWork for Steps {
        async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
            for _ in 0..100 {
                ctx.check_cancelled()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(RelayWrites::new())
        }
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_attempt() {
        let cancel = CancellationToken::new();
        let ctx = context_with_token("slow", Default::default(), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let def = TaskDefinition::new("slow", Arc::new(Slow));
        let outcome = TaskExecutor::new().execute(&def, &ctx).await;
        assert!(matches!(outcome, Outcome::Failed(DagError::ContextCancelled(_))));
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_context_never_succeeds() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = context_with_token("steps", Default::default(), cancel);

        assert!(matches!(ctx.check_cancelled(), Err(DagError::ContextCancelled(_))));
        let outcome = TaskExecutor::new().execute(&TaskDefinition::new("steps", Arc::new(Steps)), &ctx).await;
        assert!(matches!(outcome, Outcome::Failed(DagError::ContextCancelled(_))));
    }
}
