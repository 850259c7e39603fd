//! 专家工作池：Semaphore 限制同时运行的专家数

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::DiagnosisError;

#[derive(Clone, Debug)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    /// 容量至少为 1
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 获取一个执行许可；许可随返回值 drop 归还
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, DiagnosisError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DiagnosisError::Cancelled)
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
