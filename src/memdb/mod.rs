//! 内存存储网关模块
//! In-memory store gateway module
//!
//! 不依赖任何外部服务的 `JobStore` 实现，用于测试与演示
//! A `JobStore` implementation without external service dependencies, for
//! tests and demos

mod memory_store;

pub use memory_store::MemoryStore;
