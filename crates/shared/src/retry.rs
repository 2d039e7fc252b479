//! 退避策略
//!
//! 同一套指数退避参数有两种用法：
//! - 消息重投：失败消息在死信队列中按 `delay_for_attempt(重投次数)` 安排下次重投时间；
//! - 发送重试：[`retry_with_policy`] 在进程内按 [`RetryPolicy::schedule`] 逐次等待后重试。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::SavannahError;

/// 指数退避参数
///
/// 第 n 次（从 0 开始）的等待时间为 `initial_delay * multiplier^n`，不超过 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次执行之外最多再尝试的次数
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 次，1s 起步，翻倍，封顶 30s
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 失败消息的重投策略，参数来自 `[worker]` 配置段
    pub fn redelivery(config: &WorkerConfig) -> Self {
        Self {
            max_retries: config.max_redeliveries,
            initial_delay: Duration::from_millis(config.redelivery_initial_delay_ms),
            max_delay: Duration::from_millis(config.redelivery_max_delay_ms),
            multiplier: config.redelivery_multiplier,
        }
    }

    /// 第 `attempt` 次重试前的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !scaled_ms.is_finite() || scaled_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(scaled_ms.max(0.0).round() as u64)
    }

    /// 已失败 `attempt` 次后是否还能再试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 全部重试的等待时间序列，长度为 `max_retries`
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

/// 按策略重试一个异步操作
///
/// `is_retryable` 返回 false 的错误立即返回；等待序列用尽后返回最后一次的错误。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&SavannahError) -> bool,
    mut operation: F,
) -> Result<T, SavannahError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SavannahError>>,
{
    let mut delays = policy.schedule().enumerate();

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            warn!(operation = operation_name, error = %err, "不可重试的错误");
            return Err(err);
        }

        let Some((attempt, delay)) = delays.next() else {
            warn!(
                operation = operation_name,
                max_retries = policy.max_retries,
                error = %err,
                "重试次数已用尽"
            );
            return Err(err);
        };

        info!(
            operation = operation_name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "等待后重试"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_redelivery_policy_from_config() {
        let config = WorkerConfig {
            max_redeliveries: 5,
            redelivery_initial_delay_ms: 200,
            redelivery_max_delay_ms: 1_000,
            redelivery_multiplier: 3.0,
            ..WorkerConfig::default()
        };
        let policy = RetryPolicy::redelivery(&config);

        assert_eq!(policy.max_retries, 5);
        let delays: Vec<_> = policy.schedule().collect();
        assert_eq!(
            delays,
            [200, 600, 1_000, 1_000, 1_000].map(Duration::from_millis)
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.schedule().count(), 3);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);

        let result = retry_with_policy(&fast_policy(3), "publish", |_| true, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SavannahError::Kafka("broker 不可达".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_schedule() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_policy(&fast_policy(2), "publish", |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SavannahError::Kafka("broker 不可达".to_string()))
        })
        .await;

        assert!(matches!(result, Err(SavannahError::Kafka(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_policy(
            &fast_policy(3),
            "publish",
            SavannahError::is_retryable,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SavannahError::Internal("payload 过大".to_string()))
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
