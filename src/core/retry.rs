//! 重试与退避：指数 / 线性 / 固定间隔，仅对可重试错误生效

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待（attempt 从 1 开始），不超过 max_delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = attempt.max(1);
        let ms = match self.backoff {
            BackoffStrategy::Exponential => self
                .initial_delay_ms
                .saturating_mul(2u64.saturating_pow(step - 1)),
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(step as u64),
            BackoffStrategy::Fixed => self.initial_delay_ms,
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// 按 config 重试 op；is_retryable 返回 false 的错误立即返回
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays() {
        let exp = RetryConfig::default();
        assert_eq!(exp.delay_for(1), Duration::from_millis(1000));
        assert_eq!(exp.delay_for(2), Duration::from_millis(2000));
        assert_eq!(exp.delay_for(3), Duration::from_millis(4000));
        assert_eq!(exp.delay_for(10), Duration::from_millis(30_000));

        let linear = RetryConfig {
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(linear.delay_for(3), Duration::from_millis(3000));

        let fixed = RetryConfig {
            backoff: BackoffStrategy::Fixed,
            ..Default::default()
        };
        assert_eq!(fixed.delay_for(5), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let config = RetryConfig {
            initial_delay_ms: 1,
            ..Default::default()
        };
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(&config, |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {}", n))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let config = RetryConfig {
            initial_delay_ms: 1,
            ..Default::default()
        };
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&config, |_| false, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
