//! 常量定义
//! Constant definitions

use std::time::Duration;

/// 默认任务集合名称
/// Default job collection name
pub const DEFAULT_COLLECTION: &str = "mongendaJobs";

/// 默认轮询间隔
/// Default poll interval
pub const DEFAULT_PROCESS_EVERY: Duration = Duration::from_secs(5);

/// 每个定义的默认并发上限
/// Default per-definition concurrency cap
pub const DEFAULT_CONCURRENCY: usize = 5;

/// 全局默认并发上限
/// Default global concurrency cap
pub const DEFAULT_MAX_CONCURRENCY: usize = 20;

/// 默认锁生存期
/// Default lock lifetime
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// 任务状态：激活
/// Job status: active
pub const STATUS_ACTIVE: i32 = 1;

/// 任务状态：停用
/// Job status: inactive
pub const STATUS_INACTIVE: i32 = 0;

/// 有效期窗口的默认起点，1990-02-01T00:00:00Z
/// Default start of the validity window, 1990-02-01T00:00:00Z
pub fn default_start_time() -> bson::DateTime {
  bson::DateTime::from_millis(633_830_400_000)
}

/// 有效期窗口的默认终点，2099-02-01T00:00:00Z
/// Default end of the validity window, 2099-02-01T00:00:00Z
pub fn default_end_time() -> bson::DateTime {
  bson::DateTime::from_millis(4_073_587_200_000)
}
