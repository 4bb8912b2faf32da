//! 调度器模块
//! Scheduler module
//!
//! 提供任务定义、调度接口与轮询执行循环
//! Provides job definitions, the scheduling interface, and the polling
//! execution loop
//!
//! 多个调度器进程可以共享同一个集合；协调完全依赖认领时的条件更新，调度
//! 循环之间不存在任何互斥。
//! Multiple scheduler processes may share one collection; coordination relies
//! entirely on the conditional update at claim time, with no mutual exclusion
//! between the polling loops themselves.

use crate::base::constants::STATUS_ACTIVE;
use crate::base::JobStore;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::interval::When;
use crate::job::{Job, JobAttrs, JobHandler, JobType};
use crate::lock;
use crate::mdb::MongoStore;
use crate::queue::{ExecutionQueue, Governor};
use bson::oid::ObjectId;
use bson::{doc, Bson, DateTime, Document};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 任务定义的可选项，未设置时回落到调度器默认值
/// Options for a job definition; unset fields fall back to scheduler
/// defaults
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
  /// 该定义的并发上限
  /// Concurrency cap for this definition
  pub concurrency: Option<usize>,
  /// 新建任务的默认优先级
  /// Default priority for created jobs
  pub priority: Option<i32>,
  /// 锁的失效阈值
  /// Staleness threshold for locks
  pub lock_lifetime: Option<Duration>,
}

impl JobOptions {
  /// 创建空选项
  /// Create empty options
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置并发上限
  /// Set the concurrency cap
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = Some(concurrency);
    self
  }

  /// 设置默认优先级
  /// Set the default priority
  pub fn priority(mut self, priority: i32) -> Self {
    self.priority = Some(priority);
    self
  }

  /// 设置锁生存期
  /// Set the lock lifetime
  pub fn lock_lifetime(mut self, lifetime: Duration) -> Self {
    self.lock_lifetime = Some(lifetime);
    self
  }
}

/// 已注册的任务定义
/// A registered job definition
pub struct JobDefinition {
  handler: Arc<dyn JobHandler>,
  concurrency: usize,
  priority: i32,
  lock_lifetime: Duration,
  // 进程本地的运行计数，不持久化，仅由调节器改写
  // Process-local running count, not persisted, mutated only by the governor
  running: AtomicUsize,
}

impl JobDefinition {
  pub(crate) fn new(
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    priority: i32,
    lock_lifetime: Duration,
  ) -> Self {
    Self {
      handler,
      concurrency,
      priority,
      lock_lifetime,
      running: AtomicUsize::new(0),
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  pub fn priority(&self) -> i32 {
    self.priority
  }

  pub fn lock_lifetime(&self) -> Duration {
    self.lock_lifetime
  }

  /// 当前运行中的任务数
  /// Number of jobs currently running
  pub fn running(&self) -> usize {
    self.running.load(Ordering::Relaxed)
  }

  pub(crate) fn handler(&self) -> Arc<dyn JobHandler> {
    self.handler.clone()
  }

  pub(crate) fn increment_running(&self) {
    self.running.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn decrement_running(&self) {
    let _ = self
      .running
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
        count.checked_sub(1)
      });
  }
}

/// 执行循环的事件
/// Events for the execution loop
enum LoopEvent {
  /// 延迟到期的任务
  /// A job whose due time arrived
  Due(Box<Job>),
  /// 越过名称扫描的直接认领请求
  /// A direct claim request bypassing the name scan
  RunNow(Box<Job>),
  /// 一次派发的完成信号，成败皆发
  /// Completion of one dispatch, sent on success and failure alike
  Completed { name: String, id: ObjectId },
  /// 停机并批量释放锁
  /// Shut down and bulk-release locks
  Stop(oneshot::Sender<Result<()>>),
}

/// 任务调度器
/// Job scheduler
///
/// 一个实例拥有自己的定义表、执行队列与运行计数；同进程内的多个实例互不
/// 相干。
/// An instance owns its definition table, execution queue, and running
/// counts; multiple instances in one process are independent.
pub struct Scheduler {
  config: SchedulerConfig,
  store: Arc<dyn JobStore>,
  definitions: Arc<RwLock<HashMap<String, Arc<JobDefinition>>>>,
  events: Mutex<Option<mpsc::UnboundedSender<LoopEvent>>>,
  loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
  /// 连接 MongoDB 并创建调度器
  /// Connect to MongoDB and create a scheduler
  pub async fn connect(uri: &str, config: SchedulerConfig) -> Result<Self> {
    config.validate()?;
    let store = MongoStore::connect(uri, &config.collection).await?;
    store.ensure_indexes().await;
    Self::with_store(Arc::new(store), config)
  }

  /// 在任意存储网关上创建调度器
  /// Create a scheduler over any store gateway
  pub fn with_store(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      config,
      store,
      definitions: Arc::new(RwLock::new(HashMap::new())),
      events: Mutex::new(None),
      loop_handle: Mutex::new(None),
    })
  }

  /// 注册任务定义，重复注册同名定义会替换旧定义
  /// Register a job definition; redefining a name replaces the old one
  pub fn define<H>(&self, name: &str, options: JobOptions, handler: H)
  where
    H: JobHandler + 'static,
  {
    let definition = JobDefinition::new(
      Arc::new(handler),
      options.concurrency.unwrap_or(self.config.default_concurrency),
      options.priority.unwrap_or(0),
      options
        .lock_lifetime
        .unwrap_or(self.config.default_lock_lifetime),
    );
    self
      .definitions
      .write()
      .unwrap()
      .insert(name.to_string(), Arc::new(definition));
  }

  /// 查看已注册的定义
  /// Look up a registered definition
  pub fn definition(&self, name: &str) -> Option<Arc<JobDefinition>> {
    self.definitions.read().unwrap().get(name).cloned()
  }

  /// 创建一个未保存的任务
  /// Create an unsaved job
  pub fn create(&self, name: &str, data: Option<Bson>) -> Result<Job> {
    if name.trim().is_empty() {
      return Err(Error::InvalidJobName {
        name: name.to_string(),
      });
    }
    let priority = self
      .definitions
      .read()
      .unwrap()
      .get(name)
      .map(|definition| definition.priority())
      .unwrap_or(0);
    let mut attrs = JobAttrs::new(name, JobType::Normal);
    attrs.data = data;
    attrs.priority = priority;
    Ok(Job::new(attrs, self.store.clone(), self.config.name.clone()))
  }

  /// 按间隔重复执行一个任务
  /// Run a job repeatedly on an interval
  ///
  /// 同名重复调用收敛到同一条 `single` 记录
  /// Repeated calls with one name collapse onto the same `single` record
  pub async fn every(&self, interval: &str, name: &str, data: Option<Bson>) -> Result<Job> {
    self.every_with_window(interval, name, data, None, None).await
  }

  /// 带有效期窗口的重复任务
  /// A repeating job with a validity window
  pub async fn every_with_window(
    &self,
    interval: &str,
    name: &str,
    data: Option<Bson>,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
  ) -> Result<Job> {
    let mut job = self.create(name, data)?;
    job.attrs.job_type = JobType::Single;
    job.repeat_every(interval);
    if let Some(start) = start_time {
      job.attrs.start_time = DateTime::from_chrono(start);
    }
    if let Some(end) = end_time {
      job.attrs.end_time = DateTime::from_chrono(end);
    }
    job.attrs.status = STATUS_ACTIVE;
    job.attrs.locked_at = None;
    job.compute_next_run_at()?;
    job.save().await?;
    Ok(job)
  }

  /// 对多个名称分别建立重复任务
  /// Create one repeating job per name
  pub async fn every_many(
    &self,
    interval: &str,
    names: &[&str],
    data: Option<Bson>,
  ) -> Result<Vec<Job>> {
    let mut jobs = Vec::with_capacity(names.len());
    for name in names {
      jobs.push(self.every(interval, name, data.clone()).await?);
    }
    Ok(jobs)
  }

  /// 在指定时机执行一次任务
  /// Run a job once at the given time
  pub async fn schedule<W: Into<When>>(
    &self,
    when: W,
    name: &str,
    data: Option<Bson>,
  ) -> Result<Job> {
    let when = when.into();
    let mut job = self.create(name, data)?;
    job.schedule(when);
    job.save().await?;
    Ok(job)
  }

  /// 对多个名称分别安排一次执行
  /// Schedule one run per name
  pub async fn schedule_many<W: Into<When> + Copy>(
    &self,
    when: W,
    names: &[&str],
    data: Option<Bson>,
  ) -> Result<Vec<Job>> {
    let mut jobs = Vec::with_capacity(names.len());
    for name in names {
      jobs.push(self.schedule(when, name, data.clone()).await?);
    }
    Ok(jobs)
  }

  /// 立即执行一次任务
  /// Run a job once, now
  pub async fn now(&self, name: &str, data: Option<Bson>) -> Result<Job> {
    self.schedule(When::now(), name, data).await
  }

  /// 删除匹配查询的任务记录
  /// Delete job records matching the query
  pub async fn cancel(&self, query: Document) -> Result<u64> {
    self.store.delete_many(query).await
  }

  /// 删除所有名称未注册的任务记录
  /// Delete every job record whose name is not registered
  pub async fn purge(&self) -> Result<u64> {
    let defined: Vec<String> = self.definitions.read().unwrap().keys().cloned().collect();
    self
      .store
      .delete_many(doc! { "name": { "$nin": defined } })
      .await
  }

  /// 查询任务记录
  /// Query job records
  pub async fn jobs(&self, query: Document) -> Result<Vec<Job>> {
    let documents = self.store.find(query).await?;
    documents
      .into_iter()
      .map(|document| {
        Job::from_document(document, self.store.clone(), self.config.name.clone())
      })
      .collect()
  }

  /// 越过名称扫描，立刻尝试认领并执行一个已保存的任务
  /// Bypass the name scan and immediately try to claim and run a saved job
  ///
  /// 仅当记录当前未锁定时认领得到；调度器停止时忽略
  /// The claim only succeeds while the record is unlocked; ignored while the
  /// scheduler is stopped
  pub fn run_now(&self, job: &Job) {
    let events = self.events.lock().unwrap();
    match events.as_ref() {
      Some(sender) => {
        let _ = sender.send(LoopEvent::RunNow(Box::new(job.clone())));
      }
      None => tracing::debug!("run_now ignored, scheduler is stopped"),
    }
  }

  /// 调度循环是否在运行
  /// Whether the scheduling loop is running
  pub fn is_running(&self) -> bool {
    self.events.lock().unwrap().is_some()
  }

  /// 启动调度循环，重复启动是无操作
  /// Start the scheduling loop; starting twice is a no-op
  pub fn start(&self) -> Result<()> {
    let mut events = self.events.lock().unwrap();
    if events.is_some() {
      return Ok(());
    }
    let (sender, receiver) = mpsc::unbounded_channel();
    let process_loop = ProcessLoop {
      config: self.config.clone(),
      store: self.store.clone(),
      definitions: self.definitions.clone(),
      queue: ExecutionQueue::new(),
      governor: Governor::new(self.config.max_concurrency),
      sender: sender.clone(),
      receiver,
    };
    *self.loop_handle.lock().unwrap() = Some(tokio::spawn(process_loop.run()));
    *events = Some(sender);
    Ok(())
  }

  /// 停止调度循环并释放本地持有的全部锁
  /// Stop the scheduling loop and release every locally held lock
  ///
  /// 执行中的处理器不会被打断，自行运行到结束
  /// In-flight handlers are not interrupted and run to completion
  pub async fn stop(&self) -> Result<()> {
    let sender = self.events.lock().unwrap().take();
    let Some(sender) = sender else {
      return Ok(());
    };

    let (ack_sender, ack_receiver) = oneshot::channel();
    let mut unlock_result = Ok(());
    if sender.send(LoopEvent::Stop(ack_sender)).is_ok() {
      if let Ok(result) = ack_receiver.await {
        unlock_result = result;
      }
    }

    let handle = self.loop_handle.lock().unwrap().take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
    unlock_result
  }
}

/// 轮询执行循环，独占队列、调节器与运行集
/// The polling execution loop; exclusive owner of the queue, governor, and
/// running set
struct ProcessLoop {
  config: SchedulerConfig,
  store: Arc<dyn JobStore>,
  definitions: Arc<RwLock<HashMap<String, Arc<JobDefinition>>>>,
  queue: ExecutionQueue,
  governor: Governor,
  sender: mpsc::UnboundedSender<LoopEvent>,
  receiver: mpsc::UnboundedReceiver<LoopEvent>,
}

impl ProcessLoop {
  async fn run(mut self) {
    let mut ticker = tokio::time::interval(self.config.process_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          self.fill_queue().await;
          self.drain().await;
        }
        event = self.receiver.recv() => match event {
          Some(LoopEvent::Due(job)) => {
            self.queue.push_retry(*job);
            self.drain().await;
          }
          Some(LoopEvent::RunNow(job)) => {
            self.claim_direct(*job).await;
          }
          Some(LoopEvent::Completed { name, id }) => {
            self.complete(&name, id);
            self.drain().await;
          }
          Some(LoopEvent::Stop(ack)) => {
            let result = self.release_locks().await;
            let _ = ack.send(result);
            break;
          }
          None => break,
        },
      }
    }
    tracing::debug!("scheduler loop exited");
  }

  /// 对每个已注册名称循环认领，直到无可认领记录
  /// Claim repeatedly for every registered name until nothing is claimable
  ///
  /// 扫描视界为当前时刻加一个轮询间隔，更远的记录留给后续周期，避免提前
  /// 持锁
  /// The scan horizon is now plus one poll interval; records further out are
  /// left to later cycles so locks are not held early
  async fn fill_queue(&mut self) {
    let horizon = DateTime::from_millis(
      DateTime::now().timestamp_millis() + self.config.process_every.as_millis() as i64,
    );
    let definitions: Vec<(String, Arc<JobDefinition>)> = self
      .definitions
      .read()
      .unwrap()
      .iter()
      .map(|(name, definition)| (name.clone(), definition.clone()))
      .collect();

    for (name, definition) in definitions {
      loop {
        match lock::find_and_lock_next(
          self.store.as_ref(),
          &name,
          definition.lock_lifetime(),
          horizon,
        )
        .await
        {
          Ok(Some(document)) => {
            match Job::from_document(document, self.store.clone(), self.config.name.clone()) {
              Ok(job) => {
                self.queue.push_claimed(job);
                self.drain().await;
              }
              Err(error) => {
                tracing::error!("failed to decode claimed {} job: {}", name, error);
                break;
              }
            }
          }
          Ok(None) => break,
          Err(error) => {
            tracing::error!("failed to claim next {} job: {}", name, error);
            break;
          }
        }
      }
    }
    tracing::debug!("queue filled, {} pending", self.queue.len());
  }

  /// 排空队列
  /// Drain the queue
  ///
  /// 到期任务在调节器准入后派发并继续排水；被挡回的任务放回队尾，等待下
  /// 一次触发（完成、认领或到期），排水到此为止。
  /// A due job is dispatched once the governor admits it and draining
  /// continues; a gated job goes back to the tail until the next trigger
  /// (completion, claim, or due timer), and this pass ends.
  async fn drain(&mut self) {
    while let Some(job) = self.queue.pop() {
      let now = DateTime::now();
      let due = job.attrs.next_run_at.map(|at| at < now).unwrap_or(true);
      if !due {
        self.defer(job, now);
        continue;
      }

      let Some(id) = job.attrs.id else {
        tracing::warn!("dropping queued {} job without identity", job.attrs.name);
        continue;
      };
      let definition = self
        .definitions
        .read()
        .unwrap()
        .get(&job.attrs.name)
        .cloned();
      let Some(definition) = definition else {
        tracing::warn!("no definition for claimed job {}, unlocking", job.attrs.name);
        self.unlock_one(id).await;
        continue;
      };

      if self.governor.try_admit(&definition, &job.attrs.name, id) {
        self.dispatch(job, definition, id);
      } else {
        self.queue.push_retry(job);
        break;
      }
    }
  }

  /// 到期时刻的一次性延迟唤醒
  /// One-shot deferred wakeup at the due time
  fn defer(&self, job: Job, now: DateTime) {
    let wait = job
      .attrs
      .next_run_at
      .map(|at| at.timestamp_millis().saturating_sub(now.timestamp_millis()))
      .unwrap_or(0)
      .max(0) as u64;
    let sender = self.sender.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(wait)).await;
      let _ = sender.send(LoopEvent::Due(Box::new(job)));
    });
  }

  /// 派发执行，完成信号每次派发恰好发送一次
  /// Dispatch for execution; the completion signal is sent exactly once per
  /// dispatch
  fn dispatch(&mut self, job: Job, definition: Arc<JobDefinition>, id: ObjectId) {
    let sender = self.sender.clone();
    let handler = definition.handler();
    let name = job.attrs.name.clone();
    tokio::spawn(async move {
      let mut job = job;
      let outcome = AssertUnwindSafe(job.run(handler)).catch_unwind().await;
      match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!("job {} failed: {}", name, error),
        Err(_) => tracing::error!("job {} panicked; its lock is left to expire", name),
      }
      let _ = sender.send(LoopEvent::Completed { name, id });
    });
  }

  fn complete(&mut self, name: &str, id: ObjectId) {
    let definition = self.definitions.read().unwrap().get(name).cloned();
    self.governor.release(definition.as_deref(), id);
    tracing::debug!(
      "job {} finished, {} still running",
      name,
      self.governor.total_running()
    );
  }

  /// 处理越过名称扫描的直接认领
  /// Handle a direct claim bypassing the name scan
  async fn claim_direct(&mut self, job: Job) {
    let Some(id) = job.attrs.id else {
      tracing::debug!("run_now ignored for unsaved {} job", job.attrs.name);
      return;
    };
    match lock::lock_by_id(self.store.as_ref(), id).await {
      Ok(Some(_)) => {
        self.queue.push_claimed(job);
        self.drain().await;
      }
      Ok(None) => tracing::debug!("job {} is locked or disabled, not claimed", id),
      Err(error) => tracing::error!("failed to claim job {}: {}", id, error),
    }
  }

  async fn unlock_one(&self, id: ObjectId) {
    if let Err(error) = self
      .store
      .update_many(doc! { "_id": id }, doc! { "$set": { "lockedAt": Bson::Null } })
      .await
    {
      tracing::warn!("failed to unlock job {}: {}", id, error);
    }
  }

  /// 批量释放队列与运行集中持有的锁
  /// Bulk-release the locks held by the queue and the running set
  async fn release_locks(&mut self) -> Result<()> {
    let mut ids = self.queue.ids();
    ids.extend(self.governor.ids());
    if ids.is_empty() {
      return Ok(());
    }
    self
      .store
      .update_many(
        doc! { "_id": { "$in": ids } },
        doc! { "$set": { "lockedAt": Bson::Null } },
      )
      .await?;
    Ok(())
  }
}
