//! # Mongenda
//!
//! 由 MongoDB 支撑的协作式任务调度库
//! A MongoDB-backed cooperative job scheduling library
//!
//! 多个独立进程共享一个持久化任务集合，通过条件更新的乐观锁协作执行到期
//! 任务，不需要中心化的协调者。
//! Multiple independent processes share one durable job collection and
//! cooperatively execute due jobs through optimistic conditional-update
//! locking, with no central coordinator.
//!
//! ## 特性
//! ## Features
//!
//! - 每条记录同一时刻至多一个有效锁持有者
//!   - At most one live lock holder per record at any moment
//! - 按定义与全局双重并发上限
//!   - Both per-definition and global concurrency caps
//! - 锁超过生存期自动视为失效，崩溃进程持有的任务可被他人回收
//!   - Locks go stale past their lifetime, so jobs held by a crashed process
//!     are reclaimed by others
//! - `single` 类型任务按名称去重，至多保留一条待执行记录
//!   - `single` jobs deduplicate by name down to one pending record
//! - 人类可读的时间间隔，如 `"5 minutes"`
//!   - Human-readable intervals such as `"5 minutes"`
//! - 高优先级任务先被认领
//!   - Higher priority jobs are claimed first
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use mongenda::{HandlerFunc, Job, JobOptions, Scheduler, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 连接到任务集合
//!     // Connect to the job collection
//!     let scheduler =
//!         Scheduler::connect("mongodb://127.0.0.1:27017/jobs", SchedulerConfig::default())
//!             .await?;
//!
//!     // 注册任务定义
//!     // Register a job definition
//!     scheduler.define(
//!         "email:deliver",
//!         JobOptions::new().concurrency(2),
//!         HandlerFunc::new(|job: &mut Job| {
//!             println!("delivering {:?}", job.attrs.data);
//!             Ok(())
//!         }),
//!     );
//!
//!     // 每五分钟执行一次
//!     // Run every five minutes
//!     scheduler.every("5 minutes", "email:deliver", None).await?;
//!
//!     // 启动轮询循环
//!     // Start the polling loop
//!     scheduler.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod base;
pub mod config;
pub mod error;
pub mod interval;
pub mod job;
pub mod lock;
pub mod mdb;
pub mod memdb;
mod queue;
pub mod scheduler;

pub use base::{FindAndUpdateOptions, JobStore};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use interval::{parse_interval, When};
pub use job::{AsyncHandlerFunc, HandlerFunc, Job, JobAttrs, JobHandler, JobType};
pub use mdb::MongoStore;
pub use memdb::MemoryStore;
pub use scheduler::{JobDefinition, JobOptions, Scheduler};
