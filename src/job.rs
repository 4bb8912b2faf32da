//! 任务模块
//! Job module
//!
//! 定义了任务记录、任务生命周期与处理器接口
//! Defines the job record, job lifecycle, and handler interface

use crate::base::constants::{self, STATUS_ACTIVE, STATUS_INACTIVE};
use crate::base::{FindAndUpdateOptions, JobStore};
use crate::error::{Error, Result};
use crate::interval::{parse_interval, When};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, DateTime, Document};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// 任务类型
/// Job type
///
/// `Single` 表示同名任务至多保留一条待执行记录
/// `Single` means at most one pending record exists per name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
  Normal,
  Single,
}

fn default_status() -> i32 {
  STATUS_ACTIVE
}

/// 任务记录的持久化属性，线上字段名为 camelCase
/// Persisted attributes of a job record; wire field names are camelCase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttrs {
  /// 存储分配的标识
  /// Store-assigned identity
  #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
  pub id: Option<ObjectId>,
  pub name: String,
  #[serde(rename = "type")]
  pub job_type: JobType,
  /// 不透明负载，调度器从不检视
  /// Opaque payload, never inspected by the scheduler
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Bson>,
  /// 数值越大越先执行
  /// Higher runs first
  #[serde(default)]
  pub priority: i32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repeat_interval: Option<String>,
  /// 写为 null 表示已退役，不再匹配任何认领
  /// Written as null once retired; no longer matches any claim
  #[serde(default)]
  pub next_run_at: Option<DateTime>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_run_at: Option<DateTime>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_finished_at: Option<DateTime>,
  /// 始终显式写为 null 或时间戳，资格判定区分 null 与字段缺失
  /// Always written explicitly as null or a timestamp; eligibility
  /// distinguishes null from an absent field
  #[serde(default)]
  pub locked_at: Option<DateTime>,
  #[serde(default = "constants::default_start_time")]
  pub start_time: DateTime,
  #[serde(default = "constants::default_end_time")]
  pub end_time: DateTime,
  /// 1 激活，0 停用
  /// 1 active, 0 inactive
  #[serde(default = "default_status")]
  pub status: i32,
  #[serde(default)]
  pub disabled: bool,
  /// 去重片段，仅存于内存，保存时从写入集中剥离
  /// Dedup fragment, held in memory only and stripped from the write set
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unique: Option<Document>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fail_reason: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failed_at: Option<DateTime>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified_by: Option<String>,
}

impl JobAttrs {
  /// 创建带默认值的属性集
  /// Create an attribute set with defaults
  pub fn new<S: Into<String>>(name: S, job_type: JobType) -> Self {
    Self {
      id: None,
      name: name.into(),
      job_type,
      data: None,
      priority: 0,
      repeat_interval: None,
      next_run_at: None,
      last_run_at: None,
      last_finished_at: None,
      locked_at: None,
      start_time: constants::default_start_time(),
      end_time: constants::default_end_time(),
      status: STATUS_ACTIVE,
      disabled: false,
      unique: None,
      fail_reason: None,
      failed_at: None,
      last_modified_by: None,
    }
  }
}

/// 符号优先级解析
/// Symbolic priority parsing
fn parse_priority(value: &str) -> Result<i32> {
  match value {
    "lowest" => Ok(-20),
    "low" => Ok(-10),
    "normal" => Ok(0),
    "high" => Ok(10),
    "highest" => Ok(20),
    other => other
      .parse()
      .map_err(|_| Error::other(format!("invalid priority: {other}"))),
  }
}

/// 一个可调度的工作单元及其持久化入口
/// A schedulable unit of work and its persistence entry point
#[derive(Clone)]
pub struct Job {
  /// 持久化属性
  /// Persisted attributes
  pub attrs: JobAttrs,
  store: Arc<dyn JobStore>,
  scheduler_name: Option<String>,
}

impl Debug for Job {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Job")
      .field("attrs", &self.attrs)
      .field("store", &"<JobStore>")
      .finish()
  }
}

impl Job {
  pub(crate) fn new(
    attrs: JobAttrs,
    store: Arc<dyn JobStore>,
    scheduler_name: Option<String>,
  ) -> Self {
    Self {
      attrs,
      store,
      scheduler_name,
    }
  }

  /// 从存储文档重建任务
  /// Rebuild a job from a store document
  pub(crate) fn from_document(
    document: Document,
    store: Arc<dyn JobStore>,
    scheduler_name: Option<String>,
  ) -> Result<Self> {
    let attrs: JobAttrs = bson::from_document(document)?;
    Ok(Self::new(attrs, store, scheduler_name))
  }

  /// 设定执行时机
  /// Set when the job should run
  pub fn schedule<W: Into<When>>(&mut self, when: W) -> &mut Self {
    let at = when.into().resolve(Utc::now());
    self.attrs.next_run_at = Some(DateTime::from_chrono(at));
    self
  }

  /// 设定重复间隔
  /// Set the repeat interval
  pub fn repeat_every<S: Into<String>>(&mut self, interval: S) -> &mut Self {
    self.attrs.repeat_interval = Some(interval.into());
    self
  }

  /// 设定优先级，接受符号名或整数字符串
  /// Set the priority from a symbolic name or an integer string
  pub fn priority(&mut self, value: &str) -> Result<&mut Self> {
    self.attrs.priority = parse_priority(value)?;
    Ok(self)
  }

  /// 设定去重片段
  /// Set the dedup fragment
  pub fn unique(&mut self, fragment: Document) -> &mut Self {
    self.attrs.unique = Some(fragment);
    self
  }

  pub fn disable(&mut self) -> &mut Self {
    self.attrs.disabled = true;
    self
  }

  pub fn enable(&mut self) -> &mut Self {
    self.attrs.disabled = false;
    self
  }

  /// 记录一次失败
  /// Record a failure
  pub fn fail<S: Into<String>>(&mut self, reason: S) -> &mut Self {
    self.attrs.fail_reason = Some(reason.into());
    self.attrs.failed_at = Some(DateTime::now());
    self
  }

  /// 停用后任务不再参与认领
  /// A deactivated job no longer participates in claiming
  pub fn deactivate(&mut self) -> &mut Self {
    self.attrs.status = STATUS_INACTIVE;
    self
  }

  /// 依据重复间隔计算下次执行时间
  /// Compute the next run time from the repeat interval
  ///
  /// 基准为上次执行时间，从未执行过则为当前时刻。无间隔的任务清空
  /// `nextRunAt`，一次性任务由此退役。
  /// The base is the last run time, or now if the job has never run. Without
  /// an interval `nextRunAt` is cleared, which is how a one-shot job
  /// retires.
  pub fn compute_next_run_at(&mut self) -> Result<()> {
    let Some(interval) = self.attrs.repeat_interval.clone() else {
      self.attrs.next_run_at = None;
      return Ok(());
    };
    let every = parse_interval(&interval)?;
    let base = self
      .attrs
      .last_run_at
      .map(|at| at.to_chrono())
      .unwrap_or_else(Utc::now);
    let next = chrono::Duration::from_std(every)
      .ok()
      .and_then(|every| base.checked_add_signed(every))
      .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
    self.attrs.next_run_at = Some(DateTime::from_chrono(next));
    Ok(())
  }

  /// 保存任务
  /// Save the job
  ///
  /// 已有标识则按标识整体替换；`single` 类型按 (name, type) upsert，且已到期
  /// 的 `nextRunAt` 只作为插入时默认值写入，避免覆盖并发认领正在处理的值；
  /// 设定了去重片段则按片段加名称 upsert；否则直接插入。保存后把存储分配的
  /// 标识与规范的 `nextRunAt` 拷回内存记录。
  /// With an identity the record is replaced by id. A `single` job upserts on
  /// (name, type), and a due `nextRunAt` is written only as an insert-time
  /// default so an in-flight claim is not clobbered. With a dedup fragment
  /// the upsert keys on fragment plus name. Otherwise a plain insert. The
  /// store-assigned identity and canonical `nextRunAt` are copied back.
  pub async fn save(&mut self) -> Result<()> {
    let now = DateTime::now();
    self.attrs.last_modified_by = self.scheduler_name.clone();

    let mut props = bson::to_document(&self.attrs)?;
    props.remove("_id");
    props.remove("unique");

    let saved = if let Some(id) = self.attrs.id {
      self
        .store
        .find_one_and_update(
          doc! { "_id": id },
          doc! { "$set": props },
          FindAndUpdateOptions::default(),
        )
        .await?
    } else if self.attrs.job_type == JobType::Single {
      let mut protect = Document::new();
      let due = matches!(props.get("nextRunAt"), Some(Bson::DateTime(next)) if *next <= now);
      if due {
        if let Some(next) = props.remove("nextRunAt") {
          protect.insert("nextRunAt", next);
        }
      }
      let mut update = Document::new();
      update.insert("$set", props);
      if !protect.is_empty() {
        update.insert("$setOnInsert", protect);
      }
      self
        .store
        .find_one_and_update(
          doc! { "name": &self.attrs.name, "type": "single", "deleted": { "$exists": false } },
          update,
          FindAndUpdateOptions::upsert(),
        )
        .await?
    } else if let Some(unique) = &self.attrs.unique {
      let mut filter = unique.clone();
      filter.insert("name", self.attrs.name.clone());
      self
        .store
        .find_one_and_update(
          filter,
          doc! { "$set": props },
          FindAndUpdateOptions::upsert(),
        )
        .await?
    } else {
      Some(self.store.insert_one(props).await?)
    };

    if let Some(document) = saved {
      if let Ok(id) = document.get_object_id("_id") {
        self.attrs.id = Some(id);
      }
      self.attrs.next_run_at = document.get_datetime("nextRunAt").ok().copied();
    }
    Ok(())
  }

  /// 按标识删除任务记录
  /// Delete the job record by identity
  pub async fn remove(&self) -> Result<u64> {
    match self.attrs.id {
      Some(id) => self.store.delete_many(doc! { "_id": id }).await,
      None => Ok(0),
    }
  }

  /// 执行任务的完整生命周期
  /// Run the job through its full lifecycle
  ///
  /// 先写入 `lastRunAt` 与重新计算的 `nextRunAt`，再调用处理器；无论成败，
  /// 结束时释放锁并落盘。处理器的错误记录在 `failReason` 上并原样返回。
  /// Writes `lastRunAt` and the recomputed `nextRunAt` first, then invokes
  /// the handler; on either outcome the lock is released and persisted. A
  /// handler error is recorded in `failReason` and returned as-is.
  pub(crate) async fn run(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
    self.attrs.last_run_at = Some(DateTime::now());
    if let Err(error) = self.compute_next_run_at() {
      self.attrs.next_run_at = None;
      let message = error.to_string();
      self.fail(message);
      self.attrs.locked_at = None;
      self.save().await?;
      return Err(error);
    }
    self.save().await?;

    let result = handler.run(self).await;
    match &result {
      Ok(()) => {
        self.attrs.last_finished_at = Some(DateTime::now());
      }
      Err(error) => {
        let message = error.to_string();
        self.fail(message);
      }
    }
    self.attrs.locked_at = None;
    self.save().await?;
    result
  }
}

/// 任务处理器特性
/// Job handler trait
///
/// 返回值即完成信号；处理器返回后并发配额才会释放
/// The return value is the completion signal; the concurrency slot is
/// released once the handler returns
#[async_trait]
pub trait JobHandler: Send + Sync {
  /// 处理一个已认领的任务
  /// Process a claimed job
  async fn run(&self, job: &mut Job) -> Result<()>;
}

/// 函数式处理器适配器
/// Functional handler adapter
pub struct HandlerFunc<F> {
  func: F,
}

impl<F> HandlerFunc<F>
where
  F: Fn(&mut Job) -> Result<()> + Send + Sync,
{
  /// 创建新的函数式处理器
  /// Create a new functional handler
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> JobHandler for HandlerFunc<F>
where
  F: Fn(&mut Job) -> Result<()> + Send + Sync,
{
  async fn run(&self, job: &mut Job) -> Result<()> {
    (self.func)(job)
  }
}

/// 异步函数式处理器适配器，处理器接收任务的克隆
/// Asynchronous functional handler adapter; the handler receives a clone of
/// the job
pub struct AsyncHandlerFunc<F, Fut> {
  func: F,
  _phantom: std::marker::PhantomData<Fut>,
}

impl<F, Fut> AsyncHandlerFunc<F, Fut>
where
  F: Fn(Job) -> Fut + Send + Sync,
  Fut: std::future::Future<Output = Result<()>> + Send + Sync,
{
  /// 创建新的异步函数式处理器
  /// Create a new asynchronous functional handler
  pub fn new(func: F) -> Self {
    Self {
      func,
      _phantom: std::marker::PhantomData,
    }
  }
}

#[async_trait]
impl<F, Fut> JobHandler for AsyncHandlerFunc<F, Fut>
where
  F: Fn(Job) -> Fut + Send + Sync,
  Fut: std::future::Future<Output = Result<()>> + Send + Sync,
{
  async fn run(&self, job: &mut Job) -> Result<()> {
    (self.func)(job.clone()).await
  }
}
