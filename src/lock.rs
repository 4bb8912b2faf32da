//! 锁定与提取协议
//! Lock and fetch protocol
//!
//! 通过单次条件更新原子地认领一个可执行任务。两个进程争抢同一条记录时，
//! 只有先完成条件更新的一方能匹配成功，另一方的谓词在 `lockedAt` 被写入后
//! 即不再成立。
//! Atomically claims one runnable job with a single conditional update. When
//! two processes race on the same record, only the first conditional update
//! can match; the other side's predicate no longer holds once `lockedAt` has
//! been written.

use crate::base::constants::STATUS_ACTIVE;
use crate::base::{FindAndUpdateOptions, JobStore};
use crate::error::Result;
use bson::oid::ObjectId;
use bson::{doc, Bson, DateTime, Document};
use std::time::Duration;

/// 资格谓词的一个分支，三个分支仅 `lockedAt` 条件不同
/// One branch of the eligibility predicate; the three branches differ only
/// in their `lockedAt` condition
fn eligibility_branch(
  name: &str,
  now: DateTime,
  horizon: DateTime,
  locked_at: Bson,
) -> Document {
  doc! {
    "name": name,
    "startTime": { "$lte": now },
    "endTime": { "$gt": now },
    "status": STATUS_ACTIVE,
    "deleted": { "$exists": false },
    "lockedAt": locked_at,
    "nextRunAt": { "$lte": horizon },
    "disabled": { "$ne": true },
  }
}

/// 构建完整的资格过滤器
/// Build the full eligibility filter
///
/// 记录可被认领当且仅当：未锁定（null 或字段缺失），或锁早于
/// `lock_deadline` 而视为失效
/// A record is claimable iff it is unlocked (null or the field is absent),
/// or its lock predates `lock_deadline` and is considered stale
pub fn eligibility_filter(
  name: &str,
  now: DateTime,
  horizon: DateTime,
  lock_deadline: DateTime,
) -> Document {
  doc! {
    "$or": [
      eligibility_branch(name, now, horizon, Bson::Null),
      eligibility_branch(name, now, horizon, Bson::Document(doc! { "$exists": false })),
      eligibility_branch(name, now, horizon, Bson::Document(doc! { "$lte": lock_deadline })),
    ]
  }
}

/// 认领指定名称的下一个可执行任务
/// Claim the next runnable job of the given name
///
/// 匹配中优先级最高者优先；无可认领记录返回 `Ok(None)`，不是错误
/// The highest priority match wins; no claimable record is `Ok(None)`, not
/// an error
pub async fn find_and_lock_next(
  store: &dyn JobStore,
  name: &str,
  lock_lifetime: Duration,
  horizon: DateTime,
) -> Result<Option<Document>> {
  let now = DateTime::now();
  let lock_deadline =
    DateTime::from_millis(now.timestamp_millis() - lock_lifetime.as_millis() as i64);
  store
    .find_one_and_update(
      eligibility_filter(name, now, horizon, lock_deadline),
      doc! { "$set": { "lockedAt": now } },
      FindAndUpdateOptions::sorted(doc! { "priority": -1 }),
    )
    .await
}

/// 按标识直接认领一条记录，仅当它当前未被锁定
/// Claim one record directly by identity, only while it is currently
/// unlocked
pub async fn lock_by_id(store: &dyn JobStore, id: ObjectId) -> Result<Option<Document>> {
  store
    .find_one_and_update(
      doc! { "_id": id, "lockedAt": Bson::Null, "disabled": { "$ne": true } },
      doc! { "$set": { "lockedAt": DateTime::now() } },
      FindAndUpdateOptions::default(),
    )
    .await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_filter_has_three_branches() {
    let now = DateTime::now();
    let filter = eligibility_filter("report", now, now, now);
    let branches = filter.get_array("$or").unwrap();
    assert_eq!(branches.len(), 3);
  }

  #[test]
  fn test_branches_differ_only_in_locked_at() {
    let now = DateTime::now();
    let filter = eligibility_filter("report", now, now, now);
    let branches = filter.get_array("$or").unwrap();

    let locked_conditions: Vec<&Bson> = branches
      .iter()
      .map(|b| b.as_document().unwrap().get("lockedAt").unwrap())
      .collect();
    assert_eq!(locked_conditions[0], &Bson::Null);
    assert!(locked_conditions[1]
      .as_document()
      .unwrap()
      .contains_key("$exists"));
    assert!(locked_conditions[2]
      .as_document()
      .unwrap()
      .contains_key("$lte"));

    for branch in branches {
      let branch = branch.as_document().unwrap();
      assert_eq!(branch.get_str("name").unwrap(), "report");
      assert_eq!(branch.get_i32("status").unwrap(), STATUS_ACTIVE);
      assert!(branch.contains_key("nextRunAt"));
      assert!(branch.contains_key("disabled"));
    }
  }

  #[test]
  fn test_lock_deadline_is_lifetime_in_the_past() {
    let now = DateTime::now();
    let lifetime = Duration::from_secs(600);
    let deadline =
      DateTime::from_millis(now.timestamp_millis() - lifetime.as_millis() as i64);
    assert_eq!(now.timestamp_millis() - deadline.timestamp_millis(), 600_000);
  }
}
