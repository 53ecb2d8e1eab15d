//! 浏览器网关
//!
//! - session：同一会话轮次串行
//! - approval：工具审批关联（两级 TTL）
//! - message：SSE 事件名与 payload
//! - sse：帧编码与连接状态机（心跳、断开检测）

pub mod approval;
pub mod message;
pub mod session;
pub mod sse;

pub use approval::{PendingApproval, ToolApprovalCorrelator};
pub use message::{StreamEvent, STREAMING_ERROR};
pub use session::{new_session_id, SessionId, SessionLocks};
pub use sse::{encode_frame, ConnectionReport, ConnectionState, SseConnection};
