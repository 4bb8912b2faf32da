//! 调度器端到端测试
//! End-to-end scheduler tests
//!
//! 全部运行在内存存储网关上
//! All running on the in-memory store gateway

use async_trait::async_trait;
use bson::{doc, Bson};
use mongenda::{
  Error, Job, JobHandler, JobOptions, JobStore, JobType, MemoryStore, Result, Scheduler,
  SchedulerConfig, When,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 记录并发与执行次数的处理器
/// Handler recording overlap and run counts
#[derive(Clone, Default)]
struct CountingHandler {
  active: Arc<AtomicUsize>,
  max_active: Arc<AtomicUsize>,
  runs: Arc<AtomicUsize>,
  hold: Duration,
}

impl CountingHandler {
  fn holding(hold: Duration) -> Self {
    Self {
      hold,
      ..Self::default()
    }
  }

  fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }

  fn max_active(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl JobHandler for CountingHandler {
  async fn run(&self, _job: &mut Job) -> Result<()> {
    let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(current, Ordering::SeqCst);
    tokio::time::sleep(self.hold).await;
    self.active.fetch_sub(1, Ordering::SeqCst);
    self.runs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

/// 总是失败的处理器
/// Handler that always fails
struct FailingHandler {
  runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for FailingHandler {
  async fn run(&self, _job: &mut Job) -> Result<()> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    Err(Error::other("boom"))
  }
}

fn fast_config() -> SchedulerConfig {
  SchedulerConfig::new()
    .name("test:1")
    .process_every(Duration::from_millis(50))
}

fn scheduler_on(store: Arc<MemoryStore>, config: SchedulerConfig) -> Scheduler {
  Scheduler::with_store(store, config).unwrap()
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
  let started = tokio::time::Instant::now();
  while started.elapsed() < deadline {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  check()
}

#[tokio::test]
async fn test_single_job_collapses_to_one_record() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  scheduler.every("5 minutes", "report", None).await.unwrap();
  scheduler.every("5 minutes", "report", None).await.unwrap();

  let records = store.find(doc! { "name": "report" }).await.unwrap();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].get_str("type").unwrap(), "single");
}

#[tokio::test]
async fn test_due_next_run_at_is_not_clobbered() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  // 以已到期的执行时间建立 single 记录
  let first_due = bson::DateTime::from_millis(bson::DateTime::now().timestamp_millis() - 60_000);
  let mut first = scheduler.create("report", None).unwrap();
  first.attrs.job_type = JobType::Single;
  first.attrs.next_run_at = Some(first_due);
  first.save().await.unwrap();
  assert_eq!(first.attrs.next_run_at, Some(first_due));

  // 第二次保存带来另一个已到期的时间，命中已有记录时不得覆盖
  let second_due = bson::DateTime::from_millis(bson::DateTime::now().timestamp_millis() - 5_000);
  let mut second = scheduler.create("report", None).unwrap();
  second.attrs.job_type = JobType::Single;
  second.attrs.next_run_at = Some(second_due);
  second.save().await.unwrap();

  assert_eq!(second.attrs.next_run_at, Some(first_due));
  let records = store.find(doc! { "name": "report" }).await.unwrap();
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].get_datetime("nextRunAt").unwrap(), &first_due);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_definition_concurrency_is_enforced() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let handler = CountingHandler::holding(Duration::from_millis(150));
  scheduler.define("email", JobOptions::new().concurrency(1), handler.clone());

  scheduler
    .now("email", Some(Bson::from(doc! { "to": "a" })))
    .await
    .unwrap();
  scheduler
    .now("email", Some(Bson::from(doc! { "to": "b" })))
    .await
    .unwrap();

  scheduler.start().unwrap();
  // 两条记录最终都执行，但从不同时执行
  assert!(wait_until(Duration::from_secs(5), || handler.runs() >= 2).await);
  scheduler.stop().await.unwrap();

  assert_eq!(handler.max_active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_concurrency_cap_across_names() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config().max_concurrency(1));

  let handler = CountingHandler::holding(Duration::from_millis(150));
  scheduler.define("email", JobOptions::new().concurrency(5), handler.clone());
  scheduler.define("report", JobOptions::new().concurrency(5), handler.clone());

  scheduler.now("email", None).await.unwrap();
  scheduler.now("report", None).await.unwrap();

  scheduler.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || handler.runs() >= 2).await);
  scheduler.stop().await.unwrap();

  // 不同名称的任务也不会同时执行
  assert_eq!(handler.max_active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_releases_held_locks() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let handler = CountingHandler::holding(Duration::from_millis(500));
  scheduler.define("email", JobOptions::new().concurrency(1), handler.clone());

  // 三条记录：一条运行、其余在队列里等待
  for _ in 0..3 {
    scheduler.now("email", None).await.unwrap();
  }
  scheduler.start().unwrap();
  assert!(wait_until(Duration::from_secs(2), || {
    handler.active.load(Ordering::SeqCst) > 0
  })
  .await);

  scheduler.stop().await.unwrap();

  // 队列与运行集中的锁被批量释放
  let records = store.find(doc! { "name": "email" }).await.unwrap();
  for record in &records {
    assert_eq!(record.get("lockedAt").unwrap(), &Bson::Null);
  }

  // 重新启动后从干净状态继续认领执行
  scheduler.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || handler.runs() >= 3).await);
  scheduler.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_failure_releases_slot_and_records_reason() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let runs = Arc::new(AtomicUsize::new(0));
  scheduler.define(
    "email",
    JobOptions::new().concurrency(1),
    FailingHandler { runs: runs.clone() },
  );

  scheduler.now("email", None).await.unwrap();
  scheduler.now("email", None).await.unwrap();

  scheduler.start().unwrap();
  // 第一次失败不泄漏并发额度，第二条照常执行
  assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 2).await);
  scheduler.stop().await.unwrap();

  let records = store.find(doc! { "name": "email" }).await.unwrap();
  for record in &records {
    assert_eq!(record.get_str("failReason").unwrap(), "Other error: boom");
    assert!(record.get_datetime("failedAt").is_ok());
    assert_eq!(record.get("lockedAt").unwrap(), &Bson::Null);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recurring_job_runs_repeatedly() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let handler = CountingHandler::holding(Duration::from_millis(10));
  scheduler.define("tick", JobOptions::default(), handler.clone());

  scheduler.every("200ms", "tick", None).await.unwrap();
  scheduler.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || handler.runs() >= 2).await);
  scheduler.stop().await.unwrap();

  // 重复任务保持单条记录并不断推进 nextRunAt
  let records = store.find(doc! { "name": "tick" }).await.unwrap();
  assert_eq!(records.len(), 1);
  assert!(records[0].get_datetime("lastRunAt").is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_future_job_is_not_claimed_early() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let handler = CountingHandler::holding(Duration::from_millis(10));
  scheduler.define("email", JobOptions::default(), handler.clone());

  scheduler
    .schedule(When::In(Duration::from_secs(3600)), "email", None)
    .await
    .unwrap();

  scheduler.start().unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  scheduler.stop().await.unwrap();

  assert_eq!(handler.runs(), 0);
  let records = store.find(doc! { "name": "email" }).await.unwrap();
  assert_eq!(records[0].get("lockedAt").unwrap(), &Bson::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_now_bypasses_the_poll_cycle() {
  let store = Arc::new(MemoryStore::new());
  // 轮询间隔放大到一小时，确认执行不依赖扫描
  let scheduler = scheduler_on(
    store.clone(),
    SchedulerConfig::new()
      .name("test:1")
      .process_every(Duration::from_secs(3600)),
  );

  let handler = CountingHandler::holding(Duration::from_millis(10));
  scheduler.define("email", JobOptions::default(), handler.clone());
  scheduler.start().unwrap();

  // 先让首个立即 tick 过去，再保存记录
  tokio::time::sleep(Duration::from_millis(100)).await;
  let mut job = scheduler
    .schedule(When::In(Duration::from_secs(3600)), "email", None)
    .await
    .unwrap();

  job.schedule(When::now());
  scheduler.run_now(&job);

  assert!(wait_until(Duration::from_secs(5), || handler.runs() >= 1).await);
  scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn test_jobs_query_and_cancel() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  scheduler
    .now("email", Some(Bson::from(doc! { "to": "a" })))
    .await
    .unwrap();
  scheduler.now("report", None).await.unwrap();

  let jobs = scheduler.jobs(doc! { "name": "email" }).await.unwrap();
  assert_eq!(jobs.len(), 1);
  assert_eq!(jobs[0].attrs.name, "email");
  assert!(jobs[0].attrs.id.is_some());

  assert_eq!(scheduler.cancel(doc! { "name": "email" }).await.unwrap(), 1);
  assert!(scheduler.jobs(doc! { "name": "email" }).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_purge_removes_undefined_names() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  scheduler.define(
    "keep",
    JobOptions::default(),
    CountingHandler::default(),
  );
  scheduler.now("keep", None).await.unwrap();
  scheduler.now("orphan", None).await.unwrap();

  assert_eq!(scheduler.purge().await.unwrap(), 1);
  let remaining = store.find(doc! {}).await.unwrap();
  assert_eq!(remaining.len(), 1);
  assert_eq!(remaining[0].get_str("name").unwrap(), "keep");
}

#[tokio::test]
async fn test_unique_fragment_deduplicates() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  for _ in 0..2 {
    let mut job = scheduler
      .create("email", Some(Bson::from(doc! { "to": "a@example.com" })))
      .unwrap();
    job.unique(doc! { "data.to": "a@example.com" });
    job.schedule(When::In(Duration::from_secs(60)));
    job.save().await.unwrap();
  }

  // 相同去重片段收敛到一条记录
  let records = store.find(doc! { "name": "email" }).await.unwrap();
  assert_eq!(records.len(), 1);
  // unique 片段本身不会被写入记录
  assert!(!records[0].contains_key("unique"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_schedule_many_and_every_many() {
  let store = Arc::new(MemoryStore::new());
  let scheduler = scheduler_on(store.clone(), fast_config());

  let jobs = scheduler
    .schedule_many(When::In(Duration::from_secs(60)), &["a", "b"], None)
    .await
    .unwrap();
  assert_eq!(jobs.len(), 2);

  let repeating = scheduler
    .every_many("5 minutes", &["c", "d"], None)
    .await
    .unwrap();
  assert_eq!(repeating.len(), 2);
  for job in &repeating {
    assert_eq!(job.attrs.job_type, JobType::Single);
    assert!(job.attrs.next_run_at.is_some());
  }

  assert_eq!(store.find(doc! {}).await.unwrap().len(), 4);
}
