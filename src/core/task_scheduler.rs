//! 能力调用并发控制
//!
//! 同一脚本里用 Promise.all 并发发起的多个能力调用共享一个 Semaphore；许可随 tokio 任务结束释放。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::RunError;

/// 调用调度器：限制同时在跑的能力调用数
#[derive(Clone, Debug)]
pub struct CallScheduler {
    semaphore: Arc<Semaphore>,
}

impl CallScheduler {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    /// 获取一个调用许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, RunError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RunError::Sandbox(format!("call scheduler closed: {e}")))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for CallScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let scheduler = CallScheduler::new(2);
        let a = scheduler.acquire().await.unwrap();
        let _b = scheduler.acquire().await.unwrap();
        assert_eq!(scheduler.available(), 0);
        drop(a);
        assert_eq!(scheduler.available(), 1);
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(CallScheduler::new(0).available(), 1);
    }
}
