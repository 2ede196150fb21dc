use std::future::Future;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;
use crate::core::{ClipError, Result};

/// 重试策略
///
/// 配置文件中的写法：
///
/// ```toml
/// [backoff]
/// kind = "exponential"
/// initial_ms = 1000
/// multiplier = 2.0
/// max_delay_ms = 30000
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed {
        delay_ms: u64,
    },
    /// 指数退避
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    /// 线性退避
    Linear {
        initial_ms: u64,
        increment_ms: u64,
        max_delay_ms: u64,
    },
}

impl RetryStrategy {
    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay_ms: delay.as_millis() as u64 }
    }

    /// 计算第 n 次重试的延迟
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential { initial_ms, multiplier, max_delay_ms } => {
                let delay = *initial_ms as f64 * multiplier.powf(attempt as f64);
                let delay = if delay.is_finite() { delay.min(*max_delay_ms as f64) } else { *max_delay_ms as f64 };
                Duration::from_millis(delay.max(0.0) as u64)
            }
            RetryStrategy::Linear { initial_ms, increment_ms, max_delay_ms } => {
                let delay = initial_ms.saturating_add(increment_ms.saturating_mul(attempt as u64));
                Duration::from_millis(delay.min(*max_delay_ms))
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Fixed { delay_ms: 2000 }
    }
}

/// 重试配置
pub struct RetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 重试策略
    pub strategy: RetryStrategy,
    /// 是否重试的判断函数
    pub should_retry: Box<dyn Fn(&ClipError) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential {
                initial_ms: 1000,
                multiplier: 2.0,
                max_delay_ms: 60_000,
            },
            should_retry: Box::new(ClipError::is_transient),
        }
    }
}

/// 执行带重试的操作
pub async fn retry_with_config<F, Fut, T>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                // 检查是否应该重试
                if !(config.should_retry)(&error) {
                    return Err(error);
                }

                debug!(attempt, error = %error, "retryable failure");
                last_error = Some(error);

                // 如果不是最后一次尝试，等待后重试
                if attempt + 1 < max_attempts {
                    sleep(config.strategy.get_delay(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ClipError::internal_error("retry loop ran zero times")))
}

/// 重试构建器
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_config(self.config, operation).await
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
