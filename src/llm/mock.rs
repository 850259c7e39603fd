//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按 `<ROLE=...>` 角色分别脚本化回复：队列中的回复依次消费，耗尽后使用该角色的默认回复；
//! 同时记录每次请求的消息，便于断言 Agent 实际看到的上下文。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::prompt::role_of;
use crate::llm::{LlmClient, LlmError, Message};

/// 单次脚本化回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(LlmError),
    /// 永不返回，用于超时 / 取消测试
    Hang,
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    queues: Mutex<HashMap<String, VecDeque<MockReply>>>,
    defaults: Mutex<HashMap<String, MockReply>>,
    requests: Mutex<Vec<(String, Vec<Message>)>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为角色追加一条回复（按顺序消费）；role 为空串表示未带角色标识的请求
    pub fn push(self, role: &str, reply: MockReply) -> Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(role.to_string()).or_default().push_back(reply);
        }
        self
    }

    pub fn reply(self, role: &str, text: impl Into<String>) -> Self {
        self.push(role, MockReply::Text(text.into()))
    }

    /// 队列耗尽后的默认回复
    pub fn with_default(self, role: &str, reply: MockReply) -> Self {
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.insert(role.to_string(), reply);
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// 某角色收到的全部请求（按时间顺序）
    pub fn requests_for(&self, role: &str) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| {
                r.iter()
                    .filter(|(rl, _)| rl == role)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_reply(&self, role: &str) -> Option<MockReply> {
        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(role).and_then(|q| q.pop_front()));
        queued.or_else(|| {
            self.defaults
                .lock()
                .ok()
                .and_then(|d| d.get(role).cloned())
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let role = role_of(messages).unwrap_or("").to_string();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((role.clone(), messages.to_vec()));
        }

        match self.next_reply(&role) {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Hang) => std::future::pending::<Result<String, LlmError>>().await,
            None => Err(LlmError::Api(format!("no scripted reply for role '{role}'"))),
        }
    }
}
