//! 错误类型与 HTTP 映射
//!
//! 与 RetryPolicy 配合：配置错误不重试；初始化失败在退避重试耗尽后上抛；单轮执行错误不回写会话历史。

use thiserror::Error;

/// 服务运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 配置缺失或格式错误（启动时或首次使用时致命，不重试）
    #[error("Configuration error: {0}")]
    Config(String),

    /// 外部 Runtime 构造失败且重试耗尽；下次调用可从干净状态重新尝试
    #[error("Agent runtime initialization failed after {attempts} attempt(s): {reason}")]
    RuntimeInit { attempts: u32, reason: String },

    /// Runtime 句柄正在关闭
    #[error("Agent runtime is unavailable (shutting down)")]
    RuntimeUnavailable,

    /// 单轮对话执行失败（模型 / 工具错误）
    #[error("Turn execution failed: {0}")]
    TurnExecution(String),

    #[error("Turn timed out after {0}s")]
    TurnTimeout(u64),

    /// 请求格式错误
    #[error("{0}")]
    InvalidInput(String),
}

impl AgentError {
    /// 对外错误码（JSON 响应中的 code 字段）
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidInput(_) => "INVALID_INPUT",
            AgentError::RuntimeInit { .. } | AgentError::RuntimeUnavailable => "AGENT_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// 对应的 HTTP 状态码
    pub fn status(&self) -> u16 {
        match self {
            AgentError::InvalidInput(_) => 400,
            AgentError::RuntimeInit { .. } | AgentError::RuntimeUnavailable => 503,
            _ => 500,
        }
    }

    /// 是否属于调用方错误（不按系统故障记录日志）
    pub fn is_client_error(&self) -> bool {
        matches!(self, AgentError::InvalidInput(_))
    }
}
