//! 初始化重试策略
//!
//! 显式状态机（尝试计数 + 计算延迟），而非递归回调：便于取消与在暂停时钟下测试。
//! 延迟 = min(base * 2^(attempt-1), max)。

use std::time::Duration;

use crate::core::AgentError;

/// 单次失败后的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待指定时长后再次尝试
    RetryAfter(Duration),
    /// 不可重试（配置错误）或次数耗尽
    Abort,
}

/// 指数退避状态机
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// 开始下一次尝试；返回当前尝试序号（从 1 开始），次数用尽时返回 None
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    /// 已进行的尝试次数
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// 第 attempt 次失败后、下一次尝试前的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// 根据当前失败决定下一步
    pub fn on_failure(&self, err: &AgentError) -> RecoveryAction {
        if matches!(err, AgentError::Config(_)) || self.attempt >= self.max_attempts {
            return RecoveryAction::Abort;
        }
        RecoveryAction::RetryAfter(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1000), Duration::from_millis(10_000), 3)
    }

    #[test]
    fn test_delay_sequence() {
        let b = default_backoff();
        assert_eq!(b.delay_for(1), Duration::from_millis(1000));
        assert_eq!(b.delay_for(2), Duration::from_millis(2000));
        assert_eq!(b.delay_for(3), Duration::from_millis(4000));
        assert_eq!(b.delay_for(4), Duration::from_millis(8000));
        assert_eq!(b.delay_for(5), Duration::from_millis(10_000));
        assert_eq!(b.delay_for(40), Duration::from_millis(10_000));
    }

    #[test]
    fn test_attempts_exhaust() {
        let mut b = default_backoff();
        assert_eq!(b.next_attempt(), Some(1));
        assert_eq!(b.next_attempt(), Some(2));
        assert_eq!(b.next_attempt(), Some(3));
        assert_eq!(b.next_attempt(), None);
        assert_eq!(b.attempts(), 3);
    }

    #[test]
    fn test_on_failure_retries_then_aborts() {
        let mut b = default_backoff();
        let err = AgentError::TurnExecution("network".into());

        b.next_attempt();
        assert_eq!(b.on_failure(&err), RecoveryAction::RetryAfter(Duration::from_millis(1000)));
        b.next_attempt();
        assert_eq!(b.on_failure(&err), RecoveryAction::RetryAfter(Duration::from_millis(2000)));
        b.next_attempt();
        assert_eq!(b.on_failure(&err), RecoveryAction::Abort);
    }

    #[test]
    fn test_config_error_never_retried() {
        let mut b = default_backoff();
        b.next_attempt();
        let err = AgentError::Config("missing key".into());
        assert_eq!(b.on_failure(&err), RecoveryAction::Abort);
    }
}
