use async_trait::async_trait;
use dagrelay::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::info;

// 示例邮件通道：只打印，不真正发送
struct LogMailer;

#[async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<(), DagError> {
        info!(to = ?to, subject, "would send email:\n{}", body);
        Ok(())
    }
}

struct Extract;

#[async_trait]
impl UnitOfWork for Extract {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
        let source = ctx.param("source").and_then(|v| v.as_str()).unwrap_or("unknown");
        info!(source, date = %ctx.logical_date.format("%Y-%m-%d"), "extracting");

        // 模拟任务执行时间
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(RelayWrites::new()
            .with("rows", json!([{"id": 1, "amount": 10}, {"id": 2, "amount": 32}]))
            .with("source", json!(source)))
    }
}

/// Fails on its first attempt to show a retry.
struct Transform {
    calls: AtomicU32,
}

#[async_trait]
impl UnitOfWork for Transform {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DagError::TaskExecution("upstream API returned 503".to_string()));
        }

        let rows = ctx.relay_get("extract", "rows").await?;
        let total: i64 = rows
            .as_array()
            .map(|rows| rows.iter().filter_map(|r| r["amount"].as_i64()).sum())
            .unwrap_or(0);
        info!(total, attempt = ctx.attempt, "transformed");
        Ok(RelayWrites::new().with("total", json!(total)))
    }
}

struct Load;

#[async_trait]
impl UnitOfWork for Load {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RelayWrites, DagError> {
        let total = ctx.relay_get("transform", "total").await?;
        let target = ctx.param("target").and_then(|v| v.as_str()).unwrap_or("warehouse");
        info!(%total, target, "loading");
        Ok(RelayWrites::new())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging("info")?;

    let config = DagrelayConfig::from_toml_str(
        r#"
        [scheduler]
        max_concurrent_tasks = 4

        [notifications]
        log_base_url = "http://localhost:8080/log"
        "#,
    )?;

    let graph = GraphBuilder::new("etl_workflow")
        .task(TaskDefinition::noop("start"))
        .task(
            TaskDefinition::new("extract", Arc::new(Extract))
                .with_param("source", json!("https://example.com/orders"))
                .with_retries(1, Duration::from_millis(200)),
        )
        .task(
            TaskDefinition::new("transform", Arc::new(Transform { calls: AtomicU32::new(0) }))
                .with_retries(2, Duration::from_millis(200)),
        )
        .task(
            TaskDefinition::new("load", Arc::new(Load))
                .with_param("target", json!("analytics.orders_daily"))
                .with_timeout(Duration::from_secs(30)),
        )
        .task(TaskDefinition::noop("end"))
        .chain(&["start", "extract", "transform", "load", "end"])
        .build()?;

    println!("=== 任务依赖图 ===");
    graph.print_graph();

    let scheduler = Scheduler::from_config(Arc::new(graph), &config).with_notifier(Arc::new(
        EmailNotifier::new(vec!["data-team@example.com".to_string()], Arc::new(LogMailer)),
    ));

    println!("=== 开始执行任务 ===");
    let start = std::time::Instant::now();
    let request = TriggerRequest::for_date(chrono::Utc::now())
        .with_params("load", [("target".to_string(), json!("analytics.orders_backfill"))].into_iter().collect());
    let report = scheduler.run(request).await?;
    let duration = start.elapsed();

    println!("=== 执行完成 ===");
    println!("执行时间: {:?}", duration);
    println!("{}", report);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
