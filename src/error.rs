//! 错误处理模块
//! Error handling module
//!
//! 定义了 Mongenda 库中使用的各种错误类型
//! Defines various error types used in the Mongenda library

use thiserror::Error;

/// Mongenda 库的结果类型
/// Result type for the Mongenda library
pub type Result<T> = std::result::Result<T, Error>;

/// Mongenda 错误类型
/// Mongenda error type
#[derive(Error, Debug)]
pub enum Error {
  /// MongoDB 传输或查询错误
  /// MongoDB transport or query error
  #[error("MongoDB error: {0}")]
  Mongo(#[from] mongodb::error::Error),

  /// BSON 序列化错误
  /// BSON serialization error
  #[error("BSON serialization error: {0}")]
  BsonSerialize(#[from] bson::ser::Error),

  /// BSON 反序列化错误
  /// BSON deserialization error
  #[error("BSON deserialization error: {0}")]
  BsonDeserialize(#[from] bson::de::Error),

  /// 无法解析的时间间隔
  /// Unparseable time interval
  #[error("Invalid interval: {value}")]
  InvalidInterval { value: String },

  /// 无效的任务名称
  /// Invalid job name
  #[error("Invalid job name: {name}")]
  InvalidJobName { name: String },

  /// 未注册的任务定义
  /// Undefined job definition
  #[error("Job is not defined: {name}")]
  UndefinedJob { name: String },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 创建间隔解析错误
  /// Create an interval parsing error
  pub fn invalid_interval<S: Into<String>>(value: S) -> Self {
    Self::InvalidInterval {
      value: value.into(),
    }
  }

  /// 创建未定义任务错误
  /// Create an undefined job error
  pub fn undefined_job<S: Into<String>>(name: S) -> Self {
    Self::UndefinedJob { name: name.into() }
  }
}
