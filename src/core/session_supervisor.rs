//! 单次诊断请求的生命周期：请求 ID、取消令牌与全局截止时间
//!
//! 取消令牌可挂在外部父令牌下（如 CLI 的 Ctrl+C），专家各自持有子令牌。

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    request_id: String,
    cancel_token: CancellationToken,
    started_at: Instant,
    deadline: Instant,
}

impl SessionSupervisor {
    pub fn new(global_timeout: Duration, parent: Option<&CancellationToken>) -> Self {
        let started_at = Instant::now();
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            cancel_token: parent.map(|p| p.child_token()).unwrap_or_default(),
            started_at,
            deadline: started_at + global_timeout,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 创建子 token（单个专家）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 专家截止时间：不晚于全局截止时间
    pub fn expert_deadline(&self, per_expert: Duration) -> Instant {
        (Instant::now() + per_expert).min(self.deadline)
    }
}
