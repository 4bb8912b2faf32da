//! 内存存储上的完整调度演示，无需外部服务
//! Full scheduling walkthrough on the in-memory store, no external services
//!
//! ```bash
//! cargo run --example memory_demo
//! ```

use mongenda::{
  AsyncHandlerFunc, HandlerFunc, Job, JobOptions, MemoryStore, Scheduler, SchedulerConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,mongenda=debug".into()),
    )
    .init();

  let config = SchedulerConfig::new()
    .name("demo:memory")
    .process_every(Duration::from_millis(500));
  let scheduler = Scheduler::with_store(Arc::new(MemoryStore::new()), config)?;

  // 同步处理器
  // Synchronous handler
  scheduler.define(
    "email:deliver",
    JobOptions::new().concurrency(2),
    HandlerFunc::new(|job: &mut Job| {
      println!("delivering email: {:?}", job.attrs.data);
      Ok(())
    }),
  );

  // 异步处理器
  // Asynchronous handler
  scheduler.define(
    "report:generate",
    JobOptions::new().priority(10),
    AsyncHandlerFunc::new(|job: Job| async move {
      println!("generating report for {:?}", job.attrs.last_run_at);
      Ok(())
    }),
  );

  // 一次性任务与周期任务
  // One-shot and periodic jobs
  scheduler
    .now("email:deliver", Some(bson::bson!({ "to": "a@example.com" })))
    .await?;
  scheduler
    .now("email:deliver", Some(bson::bson!({ "to": "b@example.com" })))
    .await?;
  scheduler.every("1 second", "report:generate", None).await?;

  scheduler.start()?;
  tokio::time::sleep(Duration::from_secs(3)).await;
  scheduler.stop().await?;

  println!("done");
  Ok(())
}
