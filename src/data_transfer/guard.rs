use crate::config::TransferConfig;
use crate::data_transfer::errors::{TimeoutScope, TransferError, TransferResult};
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;

/// Rows written by the producer, or the error its statement raised.
pub type ProducerHandle = JoinHandle<Result<u64, String>>;

/// Owns the run deadline and the bounded wait on the producer task.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    deadline: Duration,
    grace_period: Duration,
    cleanup_timeout: Duration,
}

impl TimeoutGuard {
    pub fn new(deadline: Duration, grace_period: Duration, cleanup_timeout: Duration) -> Self {
        Self {
            deadline,
            grace_period,
            cleanup_timeout,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.timeout(),
            config.grace_period(),
            config.cleanup_timeout(),
        )
    }

    /// Runs `work` under the outer deadline. On expiry the future is dropped
    /// where it stands; whatever it already recorded stays with the caller.
    pub async fn within_deadline<F, T>(&self, work: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        match timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                scope: TimeoutScope::Deadline,
                limit: self.deadline,
            }),
        }
    }

    /// Waits at most the grace period for the producer. A producer that does
    /// not finish in time is aborted, which drops its session.
    pub async fn join_producer(&self, handle: &mut ProducerHandle) -> TransferResult<u64> {
        match timeout(self.grace_period, &mut *handle).await {
            Ok(joined) => producer_result(joined),
            Err(_) => {
                log::warn!(
                    "Producer did not finish within {:?}; abandoning it",
                    self.grace_period
                );
                handle.abort();
                Err(TransferError::Timeout {
                    scope: TimeoutScope::GracePeriod,
                    limit: self.grace_period,
                })
            }
        }
    }

    /// Bounds one cleanup step so a wedged session cannot hold cleanup hostage.
    pub async fn bounded_cleanup<F, T>(&self, step: &str, work: F) -> TransferResult<T>
    where
        F: Future<Output = Result<T, String>>,
    {
        match timeout(self.cleanup_timeout, work).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(TransferError::cleanup(step, reason)),
            Err(_) => Err(TransferError::cleanup(
                step,
                format!("timed out after {:?}", self.cleanup_timeout),
            )),
        }
    }
}

pub fn producer_result(joined: Result<Result<u64, String>, JoinError>) -> TransferResult<u64> {
    match joined {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(reason)) => Err(TransferError::failed("streaming (producer)", reason)),
        Err(e) if e.is_cancelled() => Err(TransferError::failed(
            "streaming (producer)",
            "producer task was cancelled",
        )),
        Err(e) => Err(TransferError::failed(
            "streaming (producer)",
            format!("producer task panicked: {}", e),
        )),
    }
}
