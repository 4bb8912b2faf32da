//! 存储网关模块
//! Store gateway module
//!
//! 定义了调度器与持久化存储交互的抽象层
//! Defines the abstraction layer between the scheduler and durable storage

use crate::error::Result;
use async_trait::async_trait;
use bson::Document;

pub mod constants;

/// `find_one_and_update` 的选项
/// Options for `find_one_and_update`
///
/// 更新后的文档总是被返回，调用方据此观察自己刚写入的状态
/// The post-update document is always returned so the caller observes the
/// state it just wrote
#[derive(Debug, Clone, Default)]
pub struct FindAndUpdateOptions {
  /// 无匹配时插入
  /// Insert when nothing matches
  pub upsert: bool,
  /// 候选排序，取排序后的第一个匹配
  /// Candidate sort; the first match after sorting is taken
  pub sort: Option<Document>,
}

impl FindAndUpdateOptions {
  /// 启用 upsert 的选项
  /// Options with upsert enabled
  pub fn upsert() -> Self {
    Self {
      upsert: true,
      sort: None,
    }
  }

  /// 带排序的选项
  /// Options with a sort
  pub fn sorted(sort: Document) -> Self {
    Self {
      upsert: false,
      sort: Some(sort),
    }
  }
}

/// 存储网关特性，调度器对持久化存储的全部视图
/// Store gateway trait, the scheduler's entire view of durable storage
///
/// 条件更新是跨进程协调的唯一手段，除此之外不存在任何互斥机制
/// The conditional update is the sole cross-process coordination mechanism;
/// no other mutual exclusion exists
#[async_trait]
pub trait JobStore: Send + Sync {
  /// 原子地选中一个匹配文档并更新，返回更新后的文档
  /// Atomically select one matching document and update it, returning the
  /// post-update document
  async fn find_one_and_update(
    &self,
    filter: Document,
    update: Document,
    options: FindAndUpdateOptions,
  ) -> Result<Option<Document>>;

  /// 查询所有匹配文档
  /// Find all matching documents
  async fn find(&self, filter: Document) -> Result<Vec<Document>>;

  /// 插入一个文档，返回带存储分配标识的文档
  /// Insert one document, returning it with the store-assigned identity
  async fn insert_one(&self, document: Document) -> Result<Document>;

  /// 更新所有匹配文档，返回更新条数
  /// Update all matching documents, returning the update count
  async fn update_many(&self, filter: Document, update: Document) -> Result<u64>;

  /// 删除所有匹配文档，返回删除条数
  /// Delete all matching documents, returning the delete count
  async fn delete_many(&self, filter: Document) -> Result<u64>;

  /// 尽力创建索引，失败仅记录日志
  /// Best-effort index creation; failures are only logged
  async fn ensure_indexes(&self);
}
