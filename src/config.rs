//! 配置模块
//! Configuration module
//!
//! 定义调度器的配置选项
//! Defines configuration options for the scheduler

use crate::base::constants::{
  DEFAULT_COLLECTION, DEFAULT_CONCURRENCY, DEFAULT_LOCK_LIFETIME, DEFAULT_MAX_CONCURRENCY,
  DEFAULT_PROCESS_EVERY,
};
use crate::error::{Error, Result};
use crate::interval::parse_interval;
use std::time::Duration;

/// 调度器配置
/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// 调度器名称，写入每条保存记录的 `lastModifiedBy`
  /// Scheduler name, stamped into `lastModifiedBy` on every save
  pub name: Option<String>,
  /// 轮询间隔
  /// Poll interval
  pub process_every: Duration,
  /// 每个定义未指定时的并发上限
  /// Per-definition concurrency cap when unspecified
  pub default_concurrency: usize,
  /// 全局并发上限
  /// Global concurrency cap
  pub max_concurrency: usize,
  /// 每个定义未指定时的锁生存期
  /// Lock lifetime when unspecified per definition
  pub default_lock_lifetime: Duration,
  /// 任务集合名称
  /// Job collection name
  pub collection: String,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      name: Some(default_scheduler_name()),
      process_every: DEFAULT_PROCESS_EVERY,
      default_concurrency: DEFAULT_CONCURRENCY,
      max_concurrency: DEFAULT_MAX_CONCURRENCY,
      default_lock_lifetime: DEFAULT_LOCK_LIFETIME,
      collection: DEFAULT_COLLECTION.to_string(),
    }
  }
}

/// 默认调度器标识：host:pid
/// Default scheduler identity: host:pid
fn default_scheduler_name() -> String {
  let host = hostname::get()
    .unwrap_or_default()
    .to_string_lossy()
    .to_string();
  format!("{}:{}", host, std::process::id())
}

impl SchedulerConfig {
  /// 创建新的调度器配置
  /// Create a new scheduler configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置调度器名称
  /// Set the scheduler name
  pub fn name<S: Into<String>>(mut self, name: S) -> Self {
    self.name = Some(name.into());
    self
  }

  /// 设置轮询间隔
  /// Set the poll interval
  pub fn process_every(mut self, interval: Duration) -> Self {
    self.process_every = interval;
    self
  }

  /// 以人类可读字符串设置轮询间隔
  /// Set the poll interval from a human-readable string
  pub fn process_every_str(mut self, interval: &str) -> Result<Self> {
    self.process_every = parse_interval(interval)?;
    Ok(self)
  }

  /// 设置默认并发数
  /// Set the default concurrency
  pub fn default_concurrency(mut self, concurrency: usize) -> Self {
    self.default_concurrency = concurrency.max(1);
    self
  }

  /// 设置全局并发上限
  /// Set the global concurrency cap
  pub fn max_concurrency(mut self, concurrency: usize) -> Self {
    self.max_concurrency = concurrency.max(1);
    self
  }

  /// 设置默认锁生存期
  /// Set the default lock lifetime
  pub fn default_lock_lifetime(mut self, lifetime: Duration) -> Self {
    self.default_lock_lifetime = lifetime;
    self
  }

  /// 设置任务集合名称
  /// Set the job collection name
  pub fn collection<S: Into<String>>(mut self, collection: S) -> Self {
    self.collection = collection.into();
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.process_every.is_zero() {
      return Err(Error::config("Poll interval must be greater than zero"));
    }
    if self.default_concurrency == 0 {
      return Err(Error::config("Default concurrency must be greater than 0"));
    }
    if self.max_concurrency == 0 {
      return Err(Error::config("Max concurrency must be greater than 0"));
    }
    if self.default_lock_lifetime.is_zero() {
      return Err(Error::config("Lock lifetime must be greater than zero"));
    }
    if self.collection.trim().is_empty() {
      return Err(Error::config("Collection name must not be empty"));
    }
    Ok(())
  }
}
