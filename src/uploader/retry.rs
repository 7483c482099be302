// 远端调用重试
//
// 同一请求原样重发（相同 part_id、相同字节），按指数退避等待：
// - attempt=1: initial
// - attempt=2: initial * 2
// - attempt=3: initial * 4
// 不超过 max_backoff；限流时直接等待 max_backoff

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::UploadConfig;
use crate::error::{BackendError, RemoteOp, UploadError, UploadErrorKind};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32, kind: UploadErrorKind) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);

        if matches!(kind, UploadErrorKind::RateLimited) {
            delay.max(self.max_backoff)
        } else {
            delay
        }
    }
}

/// 带重试执行一次远端调用
///
/// - 协议错误（分片被拒绝）立即返回 `UploadError::Protocol`
/// - 其他不可重试错误立即返回 `UploadError::Remote`
/// - 可重试错误最多尝试 `max_attempts` 次
/// - 等待期间被取消返回 `UploadError::Cancelled`；进行中的请求不会被打断
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: RemoteOp,
    part_id: Option<u64>,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        attempt += 1;
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.kind.is_protocol() {
            error!("{} 被远端拒绝: part={:?}, 错误: {}", operation, part_id, err);
            return Err(UploadError::Protocol {
                operation,
                part_id,
                source: err,
            });
        }

        if !err.is_retriable() || attempt >= max_attempts {
            error!(
                "{} 失败（不再重试）: part={:?}, 尝试 {}/{}, 错误: {}",
                operation, part_id, attempt, max_attempts, err
            );
            return Err(UploadError::Remote {
                operation,
                part_id,
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.delay_for(attempt, err.kind);
        warn!(
            "{} 失败，等待 {}ms 后重试 ({}/{}): part={:?}, 错误: {}",
            operation,
            delay.as_millis(),
            attempt,
            max_attempts,
            part_id,
            err
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };

        assert_eq!(policy.delay_for(1, UploadErrorKind::Network), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, UploadErrorKind::Network), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, UploadErrorKind::Network), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5, UploadErrorKind::Network), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40, UploadErrorKind::Network), Duration::from_millis(1000));

        // 限流等待更久
        assert_eq!(
            policy.delay_for(1, UploadErrorKind::RateLimited),
            Duration::from_millis(1000)
        );
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(3), RemoteOp::UploadPart, Some(1), &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::network("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_attempts_exactly_max() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            with_retry(&fast_policy(4), RemoteOp::UploadPart, Some(7), &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::from_status(503, "unavailable")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(UploadError::Remote {
                attempts, part_id, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(part_id, Some(7));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retriable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            with_retry(&fast_policy(5), RemoteOp::InitUpload, None, &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::from_status(403, "forbidden")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(UploadError::Remote { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_rejected_part_is_protocol_error() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            with_retry(&fast_policy(5), RemoteOp::UploadPart, Some(3), &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::part_rejected("duplicate part")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(UploadError::Protocol {
                part_id: Some(3),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> =
            with_retry(&fast_policy(3), RemoteOp::UploadPart, Some(0), &cancel, || async {
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }
}
