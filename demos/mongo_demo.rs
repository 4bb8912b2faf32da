//! 连接真实 MongoDB 的调度演示
//! Scheduling walkthrough against a real MongoDB
//!
//! ```bash
//! MONGODB_URL=mongodb://127.0.0.1:27017/mongenda cargo run --example mongo_demo
//! ```

use mongenda::{HandlerFunc, Job, JobOptions, Scheduler, SchedulerConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into()),
    )
    .init();

  let url = std::env::var("MONGODB_URL")
    .unwrap_or_else(|_| "mongodb://127.0.0.1:27017/mongenda".to_string());

  let config = SchedulerConfig::new().process_every(Duration::from_secs(1));
  let scheduler = Scheduler::connect(&url, config).await?;

  scheduler.define(
    "heartbeat",
    JobOptions::new().concurrency(1),
    HandlerFunc::new(|job: &mut Job| {
      println!("heartbeat at {:?}", job.attrs.last_run_at);
      Ok(())
    }),
  );

  scheduler.every("5 seconds", "heartbeat", None).await?;
  scheduler.start()?;

  println!("scheduler running, press ctrl-c to stop");
  tokio::signal::ctrl_c().await?;
  scheduler.stop().await?;
  Ok(())
}
