//! 会话历史：按 session 保存有序消息
//!
//! 插入顺序即回放顺序，不做重排或去重；会话不会被主动淘汰（无 TTL）。
//! 每次 clear 使该 session 的代数加一；轮次开始时记下代数，提交时代数不符即丢弃结果，
//! 已删除的会话不会被进行中的轮次写回。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 单个会话
#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub history: Vec<Message>,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            history: Vec::new(),
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Session>,
    /// 被 clear 过的 session 的代数；从未清除的为 0
    generations: HashMap<String, u64>,
}

impl Sessions {
    fn generation(&self, session_id: &str) -> u64 {
        self.generations.get(session_id).copied().unwrap_or(0)
    }

    fn session_mut(&mut self, session_id: &str) -> &mut Session {
        self.by_id
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
    }
}

/// 会话存储（session_id -> Session）
#[derive(Debug, Default)]
pub struct ConversationStore {
    sessions: RwLock<Sessions>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未知会话返回空序列
    pub async fn get(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .read()
            .await
            .by_id
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// 历史与当前代数（同一次读取）
    pub async fn snapshot(&self, session_id: &str) -> (Vec<Message>, u64) {
        let sessions = self.sessions.read().await;
        let history = sessions
            .by_id
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default();
        (history, sessions.generation(session_id))
    }

    pub async fn generation(&self, session_id: &str) -> u64 {
        self.sessions.read().await.generation(session_id)
    }

    /// 追加到尾部；会话不存在时创建
    pub async fn append(&self, session_id: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.session_mut(session_id);
        session.history.extend(messages);
        session.last_activity = Instant::now();
    }

    /// 用 Runtime 返回的规范历史整体替换
    pub async fn replace(&self, session_id: &str, history: Vec<Message>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.session_mut(session_id);
        session.history = history;
        session.last_activity = Instant::now();
    }

    /// 仅当代数仍为 `generation` 时替换；会话在此期间被 clear 过则不写入并返回 false
    pub async fn replace_if_current(
        &self,
        session_id: &str,
        generation: u64,
        history: Vec<Message>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.generation(session_id) != generation {
            return false;
        }
        let session = sessions.session_mut(session_id);
        session.history = history;
        session.last_activity = Instant::now();
        true
    }

    /// 删除整个会话并推进代数；返回该会话此前是否存在
    pub async fn clear(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        *sessions.generations.entry(session_id.to_string()).or_insert(0) += 1;
        sessions.by_id.remove(session_id).is_some()
    }

    /// 当前跟踪的会话数
    pub async fn count(&self) -> usize {
        self.sessions.read().await.by_id.len()
    }

    pub async fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.sessions
            .read()
            .await
            .by_id
            .get(session_id)
            .map(|s| s.last_activity)
    }
}
