//! 结构化提示与推理引擎
//!
//! Prompt 由 角色标识 / 系统指令 / 上下文块 / 对话历史 四部分组成；角色以独立的 `<ROLE=...>` system 消息注入，
//! 与自由文本指令分开，避免不同专家人设串味。

use std::sync::Arc;

use crate::llm::{LlmClient, LlmError, Message, Role};

const ROLE_TAG_PREFIX: &str = "<ROLE=";

/// 上下文块：标题 + 正文，渲染为 Markdown 小节
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub role: String,
    pub instructions: String,
    pub context_blocks: Vec<ContextBlock>,
    pub history: Vec<Message>,
}

impl Prompt {
    pub fn new(role: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            instructions: instructions.into(),
            ..Default::default()
        }
    }

    pub fn with_block(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        self.push_block(title, body);
        self
    }

    pub fn push_block(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.context_blocks.push(ContextBlock {
            title: title.into(),
            body: body.into(),
        });
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// 转为消息序列：[ROLE 标识, 指令, 上下文(user), ...历史]
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(3 + self.history.len());
        messages.push(Message::system(role_tag(&self.role)));
        messages.push(Message::system(self.instructions.clone()));
        if !self.context_blocks.is_empty() {
            let context = self
                .context_blocks
                .iter()
                .map(|b| format!("### {}\n{}", b.title, b.body))
                .collect::<Vec<_>>()
                .join("\n\n");
            messages.push(Message::user(context));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }
}

pub fn role_tag(role: &str) -> String {
    format!("{ROLE_TAG_PREFIX}{role}>")
}

/// 从消息序列中取回角色标识（只认首条 system 消息）
pub fn role_of(messages: &[Message]) -> Option<&str> {
    let first = messages.first()?;
    if first.role != Role::System {
        return None;
    }
    first
        .content
        .strip_prefix(ROLE_TAG_PREFIX)
        .and_then(|rest| rest.strip_suffix('>'))
}

/// 推理引擎：所有 Agent 共用的 generate 入口
#[derive(Clone)]
pub struct ReasoningEngine {
    client: Arc<dyn LlmClient>,
}

impl ReasoningEngine {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let messages = prompt.to_messages();
        tracing::debug!(role = %prompt.role, messages = messages.len(), "generate");
        self.client.complete(&messages).await
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.client.token_usage()
    }
}
