//! SSE 事件协议
//!
//! 事件名是与前端约定的字面量；payload 统一 camelCase，并附带 sessionId 与 RFC 3339 时间戳。

use chrono::Utc;
use serde_json::{json, Value};

use crate::runtime::Usage;

/// 流式错误事件的固定错误码
pub const STREAMING_ERROR: &str = "STREAMING_ERROR";

/// 推送给浏览器的事件（不持久化）
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    TextDelta {
        delta: String,
    },
    ToolCall {
        tool_name: String,
        args: Value,
        /// Runtime 标记需要审批，且审批关联器中仍有该工具的近期记录
        requires_approval: bool,
    },
    MessageCreated {
        content: String,
    },
    AgentUpdated {
        agent: String,
    },
    ResponseCompleted {
        usage: Usage,
    },
    FinalResult {
        content: String,
        agent: String,
        usage: Usage,
    },
    StreamComplete,
    Heartbeat,
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// `event:` 行中的事件名
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected => "connected",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::MessageCreated { .. } => "message_created",
            StreamEvent::AgentUpdated { .. } => "agent_updated",
            StreamEvent::ResponseCompleted { .. } => "response_completed",
            StreamEvent::FinalResult { .. } => "final_result",
            StreamEvent::StreamComplete => "stream_complete",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// `data:` 行的 JSON
    pub fn payload(&self, session_id: &str) -> Value {
        let mut body = match self {
            StreamEvent::Connected | StreamEvent::StreamComplete | StreamEvent::Heartbeat => {
                json!({})
            }
            StreamEvent::TextDelta { delta } => json!({ "delta": delta }),
            StreamEvent::ToolCall {
                tool_name,
                args,
                requires_approval,
            } => json!({
                "toolName": tool_name,
                "args": args,
                "requiresApproval": requires_approval,
            }),
            StreamEvent::MessageCreated { content } => json!({ "content": content }),
            StreamEvent::AgentUpdated { agent } => json!({ "agent": agent }),
            StreamEvent::ResponseCompleted { usage } => json!({ "usage": usage }),
            StreamEvent::FinalResult {
                content,
                agent,
                usage,
            } => json!({
                "content": content,
                "agent": agent,
                "usage": usage,
            }),
            StreamEvent::Error { message } => json!({
                "message": message,
                "code": STREAMING_ERROR,
            }),
        };
        if let Value::Object(map) = &mut body {
            map.insert("sessionId".to_string(), Value::String(session_id.to_string()));
            map.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_wire_names() {
        let kinds: Vec<&str> = [
            StreamEvent::Connected,
            StreamEvent::TextDelta { delta: "x".into() },
            StreamEvent::ToolCall {
                tool_name: "t".into(),
                args: json!({}),
                requires_approval: false,
            },
            StreamEvent::MessageCreated { content: "c".into() },
            StreamEvent::AgentUpdated { agent: "a".into() },
            StreamEvent::ResponseCompleted { usage: Usage::default() },
            StreamEvent::FinalResult {
                content: "c".into(),
                agent: "a".into(),
                usage: Usage::default(),
            },
            StreamEvent::StreamComplete,
            StreamEvent::Heartbeat,
            StreamEvent::Error { message: "m".into() },
        ]
        .iter()
        .map(|e| e.kind())
        .collect();

        assert_eq!(
            kinds,
            vec![
                "connected",
                "text_delta",
                "tool_call",
                "message_created",
                "agent_updated",
                "response_completed",
                "final_result",
                "stream_complete",
                "heartbeat",
                "error",
            ]
        );
    }

    #[test]
    fn test_error_payload() {
        let p = StreamEvent::Error { message: "boom".into() }.payload("abc");
        assert_eq!(p["message"], "boom");
        assert_eq!(p["code"], "STREAMING_ERROR");
        assert_eq!(p["sessionId"], "abc");
        assert!(p["timestamp"].is_string());
    }

    #[test]
    fn test_final_result_payload() {
        let p = StreamEvent::FinalResult {
            content: "Echo: Hi".into(),
            agent: "Support".into(),
            usage: Usage::new(2, 3),
        }
        .payload("abc");
        assert_eq!(p["content"], "Echo: Hi");
        assert_eq!(p["agent"], "Support");
        assert_eq!(p["usage"]["totalTokens"], 5);
        assert_eq!(p["sessionId"], "abc");
    }
}
