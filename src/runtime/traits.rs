//! 外部 Agent Runtime 边界
//!
//! 所有后端（OpenAI 兼容 / Echo / 测试脚本）实现 AgentBackend：run（阻塞到最终结果）、run_streamed（事件流）。
//! BackendFactory 负责构造实例，由 RuntimeHandle 带退避重试地调用。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Message;

/// 单轮上下文，原样透传给 Runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TurnContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            metadata: None,
        }
    }
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub requests: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            requests: 1,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// 汇总多次模型调用的用量
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Usage>) -> Usage {
        items.into_iter().fold(Usage::default(), |acc, u| Usage {
            requests: acc.requests + u.requests,
            input_tokens: acc.input_tokens + u.input_tokens,
            output_tokens: acc.output_tokens + u.output_tokens,
            total_tokens: acc.total_tokens + u.total_tokens,
        })
    }
}

/// Runtime 一轮运行的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub final_output: String,
    /// 规范化后的完整历史（含本轮 user 与 assistant 消息），会话存储以此为准
    pub history: Vec<Message>,
    pub last_agent: String,
    pub raw_usage: Vec<Usage>,
}

/// Runtime 流式事件
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// 原始文本增量
    TextDelta { delta: String },
    /// 工具调用开始
    ToolCallStarted {
        name: String,
        args: serde_json::Value,
        requires_approval: bool,
    },
    /// 一条完整的助手消息已生成
    MessageCreated { content: String },
    /// 切换到另一个 Agent
    AgentHandoff { agent: String },
    /// 一次模型响应结束
    ResponseCompleted { usage: Usage },
    /// 运行结束，携带最终结果；必须是流的最后一项
    Finished(RunOutput),
    /// 未识别的事件类型
    Unknown { kind: String },
}

pub type RuntimeEventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, String>> + Send>>;

/// 外部 Runtime 实例
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// 当前（入口）Agent 的名称
    fn identity(&self) -> &str;

    /// 阻塞直到最终结果
    async fn run(&self, input: &[Message], ctx: &TurnContext) -> Result<RunOutput, String>;

    /// 流式运行，返回事件流（以 Finished 结尾）
    async fn run_streamed(
        &self,
        input: &[Message],
        ctx: &TurnContext,
    ) -> Result<RuntimeEventStream, String>;

    /// 轻量存活探测；默认检查 identity 非空
    async fn health_check(&self) -> bool {
        !self.identity().trim().is_empty()
    }
}

/// Runtime 实例构造器
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn AgentBackend>, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_sum() {
        let total = Usage::sum(&[Usage::new(10, 5), Usage::new(3, 2)]);
        assert_eq!(total.requests, 2);
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total_tokens, 20);
        assert_eq!(Usage::sum(&[]), Usage::default());
    }

    #[test]
    fn test_usage_serializes_camel_case() {
        let json = serde_json::to_value(Usage::new(1, 2)).unwrap();
        assert_eq!(json["inputTokens"], 1);
        assert_eq!(json["outputTokens"], 2);
        assert_eq!(json["totalTokens"], 3);
    }
}
