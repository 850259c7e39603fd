//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、结构化 Prompt、嵌入

pub mod deepseek;
pub mod embedding;
pub mod message;
pub mod mock;
pub mod openai;
pub mod prompt;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use embedding::{
    cosine_similarity, create_embedder_from_config, DisabledEmbedder, EmbeddingProvider,
    HashingEmbedder, OpenAiEmbedder,
};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, MockReply};
pub use openai::{OpenAiClient, TokenUsage};
pub use prompt::{ContextBlock, Prompt, ReasoningEngine};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
