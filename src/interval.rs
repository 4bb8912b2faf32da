//! 时间间隔解析模块
//! Interval resolution module
//!
//! 将人类可读的时间描述转换为时长或时间点
//! Converts human-readable time descriptions into durations or points in time

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// 解析人类可读的时间间隔，如 "5 seconds"、"2 minutes"
/// Parse a human-readable interval such as "5 seconds" or "2 minutes"
///
/// 纯数字字符串按毫秒数解释
/// A purely numeric string is interpreted as milliseconds
pub fn parse_interval(value: &str) -> Result<Duration> {
  let value = value.trim();
  if value.is_empty() {
    return Err(Error::invalid_interval(value));
  }
  if value.bytes().all(|b| b.is_ascii_digit()) {
    let millis: u64 = value
      .parse()
      .map_err(|_| Error::invalid_interval(value))?;
    return Ok(Duration::from_millis(millis));
  }
  humantime::parse_duration(value).map_err(|_| Error::invalid_interval(value))
}

/// 任务的执行时机：绝对时间点或相对当前的偏移
/// When a job should run: an absolute point in time or an offset from now
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum When {
  /// 绝对时间点
  /// An absolute point in time
  At(DateTime<Utc>),
  /// 相对偏移
  /// A relative offset
  In(Duration),
}

impl When {
  /// 当前时刻
  /// The current moment
  pub fn now() -> Self {
    Self::At(Utc::now())
  }

  /// 以给定基准解析为绝对时间
  /// Resolve to an absolute time against the given base
  pub fn resolve(&self, base: DateTime<Utc>) -> DateTime<Utc> {
    match self {
      Self::At(at) => *at,
      Self::In(offset) => chrono::Duration::from_std(*offset)
        .ok()
        .and_then(|offset| base.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
  }
}

impl FromStr for When {
  type Err = Error;

  /// 先尝试按间隔解析（"in five minutes" 风格），再尝试 RFC 3339 日期
  /// Tries interval parsing first, then an RFC 3339 date
  fn from_str(value: &str) -> Result<Self> {
    if let Ok(offset) = parse_interval(value) {
      return Ok(Self::In(offset));
    }
    DateTime::parse_from_rfc3339(value.trim())
      .map(|at| Self::At(at.with_timezone(&Utc)))
      .map_err(|_| Error::invalid_interval(value))
  }
}

impl From<DateTime<Utc>> for When {
  fn from(at: DateTime<Utc>) -> Self {
    Self::At(at)
  }
}

impl From<Duration> for When {
  fn from(offset: Duration) -> Self {
    Self::In(offset)
  }
}

impl From<SystemTime> for When {
  fn from(at: SystemTime) -> Self {
    Self::At(DateTime::<Utc>::from(at))
  }
}
