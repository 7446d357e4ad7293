//! 重试与死信策略
//! Retry and dead-letter policy
//!
//! 纯函数：给定尝试次数、失败类型、最大尝试次数和退避参数，决定重试、永久失败还是进入死信。
//! 不依赖队列或存储，结果完全确定。
//!
//! A pure function: given the attempt count, failure kind, max attempts and back-off parameters,
//! decide between retrying, failing permanently and dead-lettering. Independent of the queue and
//! the store, and fully deterministic.

use crate::error::{Error, Result};
use std::time::Duration;

/// 失败类型
/// Failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// 网络、超时、限流等暂时性失败
  /// Network, timeout, rate limiting and other transient failures
  Transient,
  /// 无效负载、业务拒绝等永久性失败
  /// Invalid payload, business rejection and other permanent failures
  Permanent,
}

/// 策略决定
/// Policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// 等待给定时间后重新入队
  /// Re-append after the given delay
  RetryAfter(Duration),
  /// 永久失败，不进入死信
  /// Fail permanently, no dead letter
  FailPermanently,
  /// 重试预算耗尽，进入死信
  /// Retry budget exhausted, dead-letter
  DeadLetter,
}

/// 退避策略
/// Back-off policy
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
  /// 固定延迟
  /// Fixed delay
  Fixed(Duration),
  /// 指数退避：`base * multiplier^(attempts-1)`，不超过 `max_delay`
  /// Exponential back-off: `base * multiplier^(attempts-1)`, capped at `max_delay`
  Exponential {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
  },
  /// 线性退避：`base + step * (attempts-1)`，不超过 `max_delay`
  /// Linear back-off: `base + step * (attempts-1)`, capped at `max_delay`
  Linear {
    base_delay: Duration,
    max_delay: Duration,
    step: Duration,
  },
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self::default_exponential()
  }
}

impl BackoffPolicy {
  /// 默认指数退避：1 秒起，每次翻倍，最多 5 分钟
  /// Default exponential back-off: 1s, doubling, capped at 5 minutes
  pub fn default_exponential() -> Self {
    Self::Exponential {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(300),
      multiplier: 2.0,
    }
  }

  /// 计算第 `attempts` 次执行失败后的延迟（`attempts` 从 1 开始）
  /// Delay after the `attempts`-th execution failed (`attempts` starts at 1)
  pub fn delay(&self, attempts: u32) -> Duration {
    let n = attempts.saturating_sub(1);
    match self {
      BackoffPolicy::Fixed(delay) => *delay,
      BackoffPolicy::Exponential {
        base_delay,
        max_delay,
        multiplier,
      } => {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let secs = base_delay.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
          *max_delay
        } else {
          Duration::from_secs_f64(secs.max(0.0))
        }
      }
      BackoffPolicy::Linear {
        base_delay,
        max_delay,
        step,
      } => step
        .checked_mul(n)
        .and_then(|d| d.checked_add(*base_delay))
        .map_or(*max_delay, |d| d.min(*max_delay)),
    }
  }

  /// 校验参数
  /// Validate parameters
  pub fn validate(&self) -> Result<()> {
    match self {
      BackoffPolicy::Fixed(_) => Ok(()),
      BackoffPolicy::Exponential {
        base_delay,
        max_delay,
        multiplier,
      } => {
        if base_delay.is_zero() {
          return Err(Error::config("Exponential back-off base delay must be positive"));
        }
        if max_delay < base_delay {
          return Err(Error::config("Back-off max delay cannot be less than base delay"));
        }
        if !multiplier.is_finite() || *multiplier <= 1.0 {
          return Err(Error::config("Exponential back-off multiplier must be greater than 1"));
        }
        Ok(())
      }
      BackoffPolicy::Linear {
        base_delay,
        max_delay,
        ..
      } => {
        if max_delay < base_delay {
          return Err(Error::config("Back-off max delay cannot be less than base delay"));
        }
        Ok(())
      }
    }
  }
}

/// 决定一次失败之后的处理方式
/// Decide what happens after a failure
///
/// `attempts` 是已经开始的执行次数（包含刚刚失败的这一次）。
/// `attempts` is the number of executions started, including the one that just failed.
pub fn decide(
  attempts: u32,
  kind: FailureKind,
  max_attempts: u32,
  backoff: &BackoffPolicy,
) -> Decision {
  match kind {
    FailureKind::Permanent => Decision::FailPermanently,
    FailureKind::Transient if attempts >= max_attempts => Decision::DeadLetter,
    FailureKind::Transient => Decision::RetryAfter(backoff.delay(attempts)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exponential_delay() {
    let policy = BackoffPolicy::default_exponential();
    assert_eq!(policy.delay(1), Duration::from_secs(1));
    assert_eq!(policy.delay(2), Duration::from_secs(2));
    assert_eq!(policy.delay(3), Duration::from_secs(4));
    assert_eq!(policy.delay(20), Duration::from_secs(300));
    assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
  }

  #[test]
  fn test_linear_and_fixed_delay() {
    let linear = BackoffPolicy::Linear {
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(7),
      step: Duration::from_secs(2),
    };
    assert_eq!(linear.delay(1), Duration::from_secs(2));
    assert_eq!(linear.delay(2), Duration::from_secs(4));
    assert_eq!(linear.delay(4), Duration::from_secs(7));

    let fixed = BackoffPolicy::Fixed(Duration::from_millis(250));
    assert_eq!(fixed.delay(9), Duration::from_millis(250));
  }

  #[test]
  fn test_decide_transient_retries_below_ceiling() {
    let policy = BackoffPolicy::default_exponential();
    assert_eq!(
      decide(1, FailureKind::Transient, 5, &policy),
      Decision::RetryAfter(Duration::from_secs(1))
    );
    assert_eq!(
      decide(4, FailureKind::Transient, 5, &policy),
      Decision::RetryAfter(Duration::from_secs(8))
    );
  }

  #[test]
  fn test_decide_dead_letter_at_ceiling() {
    let policy = BackoffPolicy::default_exponential();
    assert_eq!(
      decide(3, FailureKind::Transient, 3, &policy),
      Decision::DeadLetter
    );
    assert_eq!(
      decide(7, FailureKind::Transient, 3, &policy),
      Decision::DeadLetter
    );
  }

  #[test]
  fn test_decide_permanent_ignores_attempts() {
    let policy = BackoffPolicy::default_exponential();
    assert_eq!(
      decide(1, FailureKind::Permanent, 5, &policy),
      Decision::FailPermanently
    );
    assert_eq!(
      decide(5, FailureKind::Permanent, 5, &policy),
      Decision::FailPermanently
    );
  }

  #[test]
  fn test_delays_strictly_increase_until_cap() {
    let policy = BackoffPolicy::Exponential {
      base_delay: Duration::from_millis(10),
      max_delay: Duration::from_secs(60),
      multiplier: 2.0,
    };
    let delays: Vec<_> = (1..=4)
      .map(|a| match decide(a, FailureKind::Transient, 5, &policy) {
        Decision::RetryAfter(d) => d,
        other => panic!("unexpected decision {other:?}"),
      })
      .collect();
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn test_validate() {
    assert!(BackoffPolicy::default_exponential().validate().is_ok());
    assert!(BackoffPolicy::Exponential {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
      multiplier: 1.0,
    }
    .validate()
    .is_err());
    assert!(BackoffPolicy::Linear {
      base_delay: Duration::from_secs(10),
      max_delay: Duration::from_secs(1),
      step: Duration::from_secs(1),
    }
    .validate()
    .is_err());
  }
}
