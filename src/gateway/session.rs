//! 会话级互斥
//!
//! 同一 session 的多轮对话串行执行（第二个请求等待第一个结束），不同 session 互不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 会话 ID（客户端提供或服务端生成）
pub type SessionId = String;

/// 每个 session 一把异步锁
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// 等待并持有该 session 的轮次锁；guard 释放即解锁
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(session_id).lock_owned().await
    }

    /// 清除会话时移除空闲的锁；仍被持有或有人等待时保留，返回是否移除。
    /// 克隆只发生在 map 锁内，所以此处看到的引用计数不会再增加。
    pub fn remove(&self, session_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        match locks.get(session_id) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 生成新的会话 ID
pub fn new_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1").await;

        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.acquire("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);

        drop(a);
        assert!(locks.remove("a"));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_keeps_held_lock() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1").await;
        assert!(!locks.remove("s1"));

        // 仍是同一把锁，后来者必须等待
        let l = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l.acquire("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(locks.remove("s1"));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_new_session_id_prefix() {
        let id = new_session_id();
        assert!(id.starts_with("session_"));
        assert_ne!(id, new_session_id());
    }
}
