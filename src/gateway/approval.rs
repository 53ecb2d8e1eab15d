//! 工具审批关联
//!
//! 执行器在看到需要审批的工具调用时记录 (session → 工具名, 参数, 时间)，网关渲染 tool_call 事件时查询。
//! 两个时间窗口：存储 TTL（默认 10s，lookup 时顺带清除所有过期记录）与相关性 TTL（默认 5s，仅此窗口内的记录算数）。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ApprovalSection;

/// 一条待审批的工具调用
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub recorded_at: Instant,
}

pub struct ToolApprovalCorrelator {
    entries: Mutex<HashMap<String, PendingApproval>>,
    storage_ttl: Duration,
    relevance_ttl: Duration,
}

impl Default for ToolApprovalCorrelator {
    fn default() -> Self {
        Self::new(Duration::from_millis(10_000), Duration::from_millis(5_000))
    }
}

impl ToolApprovalCorrelator {
    pub fn new(storage_ttl: Duration, relevance_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            storage_ttl,
            relevance_ttl,
        }
    }

    pub fn from_config(cfg: &ApprovalSection) -> Self {
        Self::new(
            Duration::from_millis(cfg.storage_ttl_ms),
            Duration::from_millis(cfg.relevance_ttl_ms),
        )
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 覆盖该 session 之前的记录
    pub fn record(&self, session_id: &str, tool_name: &str, args: serde_json::Value) {
        tracing::debug!(session_id, tool = tool_name, "Recording tool call awaiting approval");
        self.entries().insert(
            session_id.to_string(),
            PendingApproval {
                tool_name: tool_name.to_string(),
                args,
                recorded_at: Instant::now(),
            },
        );
    }

    /// 相关性窗口内返回工具名；同时清除所有超过存储 TTL 的记录
    pub fn lookup(&self, session_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.recorded_at) <= self.storage_ttl);
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, "Purged stale tool approval entries");
        }

        entries
            .get(session_id)
            .filter(|e| now.duration_since(e.recorded_at) < self.relevance_ttl)
            .map(|e| e.tool_name.clone())
    }

    /// 不做过期判断的原样读取
    pub fn peek(&self, session_id: &str) -> Option<PendingApproval> {
        self.entries().get(session_id).cloned()
    }

    pub fn clear(&self, session_id: &str) {
        self.entries().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_lookup_windows() {
        let c = ToolApprovalCorrelator::default();
        c.record("s", "lookupOrder", json!({}));

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert_eq!(c.lookup("s").as_deref(), Some("lookupOrder"));

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(c.lookup("s"), None);
        // 超出相关性窗口但仍在存储窗口内
        assert_eq!(c.len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(c.lookup("other"), None);
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_overwrites() {
        let c = ToolApprovalCorrelator::default();
        c.record("s", "refund", json!({"amount": 10}));
        tokio::time::advance(Duration::from_secs(4)).await;
        c.record("s", "cancelOrder", json!({"id": "42"}));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(c.lookup("s").as_deref(), Some("cancelOrder"));
        assert_eq!(c.peek("s").unwrap().args, json!({"id": "42"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_config() {
        let cfg = ApprovalSection {
            storage_ttl_ms: 2_000,
            relevance_ttl_ms: 1_000,
        };
        let c = ToolApprovalCorrelator::from_config(&cfg);
        c.record("a", "t", json!(null));
        c.record("b", "t", json!(null));
        c.clear("a");
        assert_eq!(c.lookup("a"), None);
        assert_eq!(c.len(), 1);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(c.lookup("b"), None);
        assert_eq!(c.len(), 1);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        c.lookup("b");
        assert!(c.is_empty());
    }
}
