//! Повторы внешних операций с ограниченной экспоненциальной задержкой.

use std::{future::Future, time::Duration};

use log::warn;

use crate::{config::RetrySettings, error::SiteResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay_ms: settings.base_delay_ms.max(1),
            max_delay_ms: settings.max_delay_ms.max(settings.base_delay_ms),
        }
    }

    /// Задержка после неудачной попытки номер `failed_attempt` (с 1)
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        // attempt=1 -> base, attempt=2 -> base*2, attempt=3 -> base*4, не больше max
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let backoff_ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(backoff_ms)
    }

    /// Выполняет операцию, повторяя её при ошибках внешних программ
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> SiteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SiteResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{}: попытка {}/{} не удалась: {}. Повтор через {} мс",
                        label,
                        attempt,
                        self.max_attempts,
                        error,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SiteError;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
        })
    }

    fn tool_error() -> SiteError {
        SiteError::ExternalTool {
            tool: "git".into(),
            status: 128,
            stderr: "Could not resolve host".into(),
        }
    }

    #[test]
    fn delays_grow_exponentially_and_are_capped() {
        let policy = RetryPolicy::from_settings(&RetrySettings {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_external_tool_errors_until_success() {
        let calls = Cell::new(0);
        let result = policy(3)
            .run("clone", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(tool_error())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: SiteResult<()> = policy(2)
            .run("clone", || {
                calls.set(calls.get() + 1);
                async { Err(tool_error()) }
            })
            .await;
        assert!(matches!(result, Err(SiteError::ExternalTool { .. })));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: SiteResult<()> = policy(5)
            .run("clone", || {
                calls.set(calls.get() + 1);
                async { Err(SiteError::Validation("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
