//! Bounded execution pool.
//!
//! Skill executions run under a semaphore so a burst of proposals
//! cannot exhaust the host. Dispatch into a full pool retries a few
//! times with backoff, then fails the request rather than queueing
//! unboundedly.

use otto_common::config::WorkerConfig;
use otto_common::error::KernelError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            config,
        }
    }

    /// Run a task under a pool permit. Fails with `ExecutionFailure`
    /// after the retry budget if the pool stays full.
    pub async fn run<F, T>(&self, label: &str, task: F) -> Result<T, KernelError>
    where
        F: Future<Output = Result<T, KernelError>>,
    {
        let mut attempt = 0u32;
        let _permit = loop {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => {
                    if attempt >= self.config.dispatch_retries {
                        return Err(KernelError::ExecutionFailure(format!(
                            "worker pool exhausted dispatching '{}'",
                            label
                        )));
                    }
                    attempt += 1;
                    debug!("Pool full, retry {} for '{}'", attempt, label);
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
            }
        };
        task.await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_released_after_task() {
        let pool = WorkerPool::new(WorkerConfig {
            pool_size: 2,
            ..WorkerConfig::default()
        });
        let result = pool.run("noop", async { Ok::<_, KernelError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_after_retries() {
        let pool = Arc::new(WorkerPool::new(WorkerConfig {
            pool_size: 1,
            dispatch_retries: 2,
            retry_backoff_ms: 5,
        }));

        let blocker = Arc::clone(&pool);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = tokio::spawn(async move {
            blocker
                .run("hold", async {
                    let _ = release_rx.await;
                    Ok::<_, KernelError>(())
                })
                .await
        });
        // Let the holder take the only permit.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 0);

        let err = pool
            .run("blocked", async { Ok::<_, KernelError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ExecutionFailure(_)));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_task_error_propagates() {
        let pool = WorkerPool::new(WorkerConfig::default());
        let err = pool
            .run("fail", async {
                Err::<(), _>(KernelError::ExecutionFailure("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ExecutionFailure(_)));
    }
}
