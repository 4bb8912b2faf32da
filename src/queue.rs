//! 本地执行队列与并发调节器
//! Local execution queue and concurrency governor

use crate::job::Job;
use crate::scheduler::JobDefinition;
use bson::oid::ObjectId;
use std::collections::VecDeque;

/// 已认领、尚未开始执行的任务缓冲
/// Buffer of claimed jobs not yet started
///
/// 新认领的任务进队首，被门限挡回或延迟到期的任务进队尾；出队总是从队尾
/// 取，因此被挡回的任务先于更早的认领被重试。
/// Newly claimed jobs enter at the front; gated or due-again jobs enter at
/// the back. Draining always pops from the back, so a gated job is retried
/// before older claims.
#[derive(Default)]
pub(crate) struct ExecutionQueue {
  jobs: VecDeque<Job>,
}

impl ExecutionQueue {
  pub(crate) fn new() -> Self {
    Self {
      jobs: VecDeque::new(),
    }
  }

  /// 新认领的任务
  /// A newly claimed job
  pub(crate) fn push_claimed(&mut self, job: Job) {
    self.jobs.push_front(job);
  }

  /// 被挡回或到期重试的任务
  /// A gated or due-again job
  pub(crate) fn push_retry(&mut self, job: Job) {
    self.jobs.push_back(job);
  }

  pub(crate) fn pop(&mut self) -> Option<Job> {
    self.jobs.pop_back()
  }

  pub(crate) fn len(&self) -> usize {
    self.jobs.len()
  }

  /// 队列中所有已持锁记录的标识，停机时用于批量解锁
  /// Identities of every locked record in the queue, for the bulk unlock on
  /// shutdown
  pub(crate) fn ids(&self) -> Vec<ObjectId> {
    self.jobs.iter().filter_map(|job| job.attrs.id).collect()
  }
}

/// 并发调节器
/// Concurrency governor
///
/// 同时约束单个定义的运行数和全局运行总数，任一超限则拒绝准入
/// Enforces both the per-definition running count and the global running
/// total; admission is refused when either cap is exceeded
pub(crate) struct Governor {
  max_concurrency: usize,
  running: Vec<(String, ObjectId)>,
}

impl Governor {
  pub(crate) fn new(max_concurrency: usize) -> Self {
    Self {
      max_concurrency,
      running: Vec::new(),
    }
  }

  /// 尝试准入，成功则登记运行并递增该定义的计数
  /// Try to admit; on success the job is registered as running and the
  /// definition's counter is incremented
  pub(crate) fn try_admit(&mut self, definition: &JobDefinition, name: &str, id: ObjectId) -> bool {
    if definition.running() >= definition.concurrency() {
      return false;
    }
    if self.running.len() >= self.max_concurrency {
      return false;
    }
    definition.increment_running();
    self.running.push((name.to_string(), id));
    true
  }

  /// 完成释放，计数递减恰好一次
  /// Release on completion; the counter is decremented exactly once
  pub(crate) fn release(&mut self, definition: Option<&JobDefinition>, id: ObjectId) {
    if let Some(position) = self.running.iter().position(|(_, running)| *running == id) {
      self.running.remove(position);
      if let Some(definition) = definition {
        definition.decrement_running();
      }
    }
  }

  pub(crate) fn total_running(&self) -> usize {
    self.running.len()
  }

  /// 运行集中所有记录的标识
  /// Identities of every record in the running set
  pub(crate) fn ids(&self) -> Vec<ObjectId> {
    self.running.iter().map(|(_, id)| *id).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{HandlerFunc, JobAttrs, JobType};
  use crate::memdb::MemoryStore;
  use std::sync::Arc;
  use std::time::Duration;

  fn test_job(name: &str) -> Job {
    let mut attrs = JobAttrs::new(name, JobType::Normal);
    attrs.id = Some(ObjectId::new());
    Job::new(attrs, Arc::new(MemoryStore::new()), None)
  }

  fn test_definition(concurrency: usize) -> JobDefinition {
    JobDefinition::new(
      Arc::new(HandlerFunc::new(|_job: &mut Job| Ok(()))),
      concurrency,
      0,
      Duration::from_secs(600),
    )
  }

  #[test]
  fn test_queue_order() {
    let mut queue = ExecutionQueue::new();
    let first = test_job("first");
    let second = test_job("second");
    let retried = test_job("retried");

    // 认领顺序：first、second；随后一个重试入队
    queue.push_claimed(first.clone());
    queue.push_claimed(second.clone());
    queue.push_retry(retried.clone());

    assert_eq!(queue.pop().unwrap().attrs.id, retried.attrs.id);
    assert_eq!(queue.pop().unwrap().attrs.id, first.attrs.id);
    assert_eq!(queue.pop().unwrap().attrs.id, second.attrs.id);
    assert!(queue.pop().is_none());
  }

  #[test]
  fn test_queue_ids() {
    let mut queue = ExecutionQueue::new();
    let job = test_job("a");
    queue.push_claimed(job.clone());
    assert_eq!(queue.ids(), vec![job.attrs.id.unwrap()]);
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn test_governor_per_definition_cap() {
    let mut governor = Governor::new(10);
    let definition = test_definition(1);

    assert!(governor.try_admit(&definition, "email", ObjectId::new()));
    assert!(!governor.try_admit(&definition, "email", ObjectId::new()));
    assert_eq!(definition.running(), 1);
  }

  #[test]
  fn test_governor_global_cap() {
    let mut governor = Governor::new(1);
    let email = test_definition(5);
    let report = test_definition(5);

    assert!(governor.try_admit(&email, "email", ObjectId::new()));
    assert!(!governor.try_admit(&report, "report", ObjectId::new()));
    assert_eq!(governor.total_running(), 1);
  }

  #[test]
  fn test_governor_release_reopens_slot() {
    let mut governor = Governor::new(1);
    let definition = test_definition(1);
    let id = ObjectId::new();

    assert!(governor.try_admit(&definition, "email", id));
    governor.release(Some(&definition), id);
    assert_eq!(definition.running(), 0);
    assert_eq!(governor.total_running(), 0);
    assert!(governor.try_admit(&definition, "email", ObjectId::new()));
  }

  #[test]
  fn test_governor_release_unknown_id_is_noop() {
    let mut governor = Governor::new(1);
    let definition = test_definition(1);

    governor.release(Some(&definition), ObjectId::new());
    assert_eq!(definition.running(), 0);
  }
}
