//! 单轮对话执行
//!
//! TurnExecutor 把一条用户消息跑成一轮：读取会话历史 → 拼接输入 → 取得 Runtime → 阻塞或流式执行 →
//! 用 Runtime 返回的规范历史整体替换会话。执行器本身不重试；失败或中途放弃的轮次不会写回历史。
//! 同一 session 的轮次串行（持有 SessionLocks），整轮受 turn_timeout 约束，工具调用后等待下一事件受 tool_timeout 约束。
//! 轮次进行中会话被删除时，本轮结果照常返回给调用方但不写回历史。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::gateway::{SessionLocks, ToolApprovalCorrelator};
use crate::memory::{ConversationStore, Message};
use crate::runtime::{RunOutput, RuntimeEvent, RuntimeEventStream, RuntimeHandle, Usage};

pub use crate::runtime::TurnContext;

/// 阻塞模式的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub final_output: String,
    pub agent: String,
    pub usage: Usage,
}

impl From<&RunOutput> for TurnResult {
    fn from(out: &RunOutput) -> Self {
        Self {
            final_output: out.final_output.clone(),
            agent: out.last_agent.clone(),
            usage: Usage::sum(&out.raw_usage),
        }
    }
}

/// 流式模式下执行器产出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TextDelta {
        delta: String,
    },
    ToolCall {
        name: String,
        args: serde_json::Value,
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
    /// 最后一项；此时历史已提交
    Final(TurnResult),
    Unknown {
        kind: String,
    },
}

pub type TurnEventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, AgentError>> + Send>>;

/// 单轮执行器（可克隆，内部全部共享）
#[derive(Clone)]
pub struct TurnExecutor {
    runtime: RuntimeHandle,
    store: Arc<ConversationStore>,
    approvals: Arc<ToolApprovalCorrelator>,
    locks: Arc<SessionLocks>,
    turn_timeout: Duration,
    tool_timeout: Duration,
}

impl TurnExecutor {
    pub fn new(
        runtime: RuntimeHandle,
        store: Arc<ConversationStore>,
        approvals: Arc<ToolApprovalCorrelator>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            runtime,
            store,
            approvals,
            locks,
            turn_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeouts(mut self, turn_timeout: Duration, tool_timeout: Duration) -> Self {
        self.turn_timeout = turn_timeout;
        self.tool_timeout = tool_timeout;
        self
    }

    pub fn from_config(
        cfg: &AppConfig,
        runtime: RuntimeHandle,
        store: Arc<ConversationStore>,
        approvals: Arc<ToolApprovalCorrelator>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self::new(runtime, store, approvals, locks)
            .with_timeouts(cfg.agent.turn_timeout(), cfg.agent.tool_timeout())
    }

    fn validate(session_id: &str, message: &str) -> Result<(), AgentError> {
        if session_id.trim().is_empty() {
            return Err(AgentError::InvalidInput("sessionId must not be empty".to_string()));
        }
        if message.trim().is_empty() {
            return Err(AgentError::InvalidInput(
                "Message is required and must be a non-empty string".to_string(),
            ));
        }
        Ok(())
    }

    /// 输入序列与读取时的会话代数
    async fn build_input(&self, session_id: &str, message: &str) -> (Vec<Message>, u64) {
        let (mut input, generation) = self.store.snapshot(session_id).await;
        input.push(Message::user(message));
        (input, generation)
    }

    async fn commit(&self, session_id: &str, generation: u64, history: Vec<Message>) {
        if !self.store.replace_if_current(session_id, generation, history).await {
            tracing::info!(session_id, "Session cleared during turn, discarding history");
        }
    }

    /// 阻塞到最终结果
    pub async fn run_turn(
        &self,
        session_id: &str,
        message: &str,
        ctx: TurnContext,
    ) -> Result<TurnResult, AgentError> {
        Self::validate(session_id, message)?;
        let _guard = self.locks.acquire(session_id).await;

        let (input, generation) = self.build_input(session_id, message).await;
        let runtime = self.runtime.get_runtime().await?;
        tracing::info!(session_id, history_len = input.len() - 1, "Running turn");

        let output = tokio::time::timeout(self.turn_timeout, runtime.run(&input, &ctx))
            .await
            .map_err(|_| AgentError::TurnTimeout(self.turn_timeout.as_secs()))?
            .map_err(AgentError::TurnExecution)
            .inspect_err(|e| tracing::warn!(session_id, error = %e, "Turn failed"))?;

        let result = TurnResult::from(&output);
        self.commit(session_id, generation, output.history).await;
        tracing::info!(session_id, agent = %result.agent, "Turn completed");
        Ok(result)
    }

    /// 流式执行：惰性、只能消费一次；入参校验立即进行，其余工作在首次 poll 时开始。
    /// 丢弃返回的流即放弃本轮（不提交历史，释放会话锁）。
    pub fn run_turn_streamed(
        &self,
        session_id: &str,
        message: &str,
        ctx: TurnContext,
    ) -> Result<TurnEventStream, AgentError> {
        Self::validate(session_id, message)?;

        let state = StreamedTurn {
            exec: self.clone(),
            session_id: session_id.to_string(),
            message: message.to_string(),
            ctx,
            phase: Phase::Start,
        };
        Ok(Box::pin(stream::unfold(state, |mut st| async move {
            let item = st.step().await?;
            Some((item, st))
        })))
    }
}

enum Phase {
    Start,
    Running {
        _guard: OwnedMutexGuard<()>,
        generation: u64,
        events: RuntimeEventStream,
        deadline: Instant,
        /// 上一个事件是工具调用，下一事件受 tool_timeout 约束
        after_tool: bool,
    },
    Done,
}

struct StreamedTurn {
    exec: TurnExecutor,
    session_id: String,
    message: String,
    ctx: TurnContext,
    phase: Phase,
}

impl StreamedTurn {
    fn fail(&mut self, err: AgentError) -> Option<Result<TurnEvent, AgentError>> {
        tracing::warn!(session_id = %self.session_id, error = %err, "Streamed turn failed");
        self.phase = Phase::Done;
        Some(Err(err))
    }

    async fn start(&mut self) -> Result<(), AgentError> {
        let exec = &self.exec;
        let guard = exec.locks.acquire(&self.session_id).await;
        let deadline = Instant::now() + exec.turn_timeout;

        let (input, generation) = exec.build_input(&self.session_id, &self.message).await;
        let runtime = exec.runtime.get_runtime().await?;
        tracing::info!(session_id = %self.session_id, history_len = input.len() - 1, "Running streamed turn");

        let events = tokio::time::timeout_at(deadline, runtime.run_streamed(&input, &self.ctx))
            .await
            .map_err(|_| AgentError::TurnTimeout(exec.turn_timeout.as_secs()))?
            .map_err(AgentError::TurnExecution)?;

        self.phase = Phase::Running {
            _guard: guard,
            generation,
            events,
            deadline,
            after_tool: false,
        };
        Ok(())
    }

    /// 产出下一项；None 表示流结束
    async fn step(&mut self) -> Option<Result<TurnEvent, AgentError>> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::Start => {
                    if let Err(e) = self.start().await {
                        return self.fail(e);
                    }
                }
                Phase::Running { .. } => break,
            }
        }

        let turn_timeout = self.exec.turn_timeout;
        let tool_timeout = self.exec.tool_timeout;
        let Phase::Running {
            generation,
            events,
            deadline,
            after_tool,
            ..
        } = &mut self.phase
        else {
            return None;
        };

        let tool_deadline = Instant::now() + tool_timeout;
        let (wait_until, timeout_err) = if *after_tool && tool_deadline < *deadline {
            (tool_deadline, AgentError::TurnTimeout(tool_timeout.as_secs()))
        } else {
            (*deadline, AgentError::TurnTimeout(turn_timeout.as_secs()))
        };

        let next = match tokio::time::timeout_at(wait_until, events.next()).await {
            Ok(next) => next,
            Err(_) => return self.fail(timeout_err),
        };
        *after_tool = false;

        let event = match next {
            None => {
                return self.fail(AgentError::TurnExecution(
                    "runtime stream ended without a final result".to_string(),
                ))
            }
            Some(Err(e)) => return self.fail(AgentError::TurnExecution(e)),
            Some(Ok(event)) => event,
        };

        let mapped = match event {
            RuntimeEvent::TextDelta { delta } => TurnEvent::TextDelta { delta },
            RuntimeEvent::ToolCallStarted {
                name,
                args,
                requires_approval,
            } => {
                *after_tool = true;
                if requires_approval {
                    self.exec.approvals.record(&self.session_id, &name, args.clone());
                }
                tracing::debug!(session_id = %self.session_id, tool = %name, requires_approval, "Tool call started");
                TurnEvent::ToolCall {
                    name,
                    args,
                    requires_approval,
                }
            }
            RuntimeEvent::MessageCreated { content } => TurnEvent::MessageCreated { content },
            RuntimeEvent::AgentHandoff { agent } => {
                tracing::info!(session_id = %self.session_id, agent = %agent, "Agent handoff");
                TurnEvent::AgentUpdated { agent }
            }
            RuntimeEvent::ResponseCompleted { usage } => TurnEvent::ResponseCompleted { usage },
            RuntimeEvent::Unknown { kind } => TurnEvent::Unknown { kind },
            RuntimeEvent::Finished(output) => {
                let result = TurnResult::from(&output);
                let generation = *generation;
                self.exec.commit(&self.session_id, generation, output.history).await;
                tracing::info!(session_id = %self.session_id, agent = %result.agent, "Streamed turn completed");
                // 释放会话锁
                self.phase = Phase::Done;
                TurnEvent::Final(result)
            }
        };
        Some(Ok(mapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        AgentBackend, BackendFactory, EchoFactory, RuntimeOptions, ScriptedBackend, StaticFactory,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixture {
        exec: TurnExecutor,
        store: Arc<ConversationStore>,
        approvals: Arc<ToolApprovalCorrelator>,
        locks: Arc<SessionLocks>,
    }

    fn fixture(factory: Arc<dyn BackendFactory>) -> Fixture {
        let store = Arc::new(ConversationStore::new());
        let approvals = Arc::new(ToolApprovalCorrelator::default());
        let locks = Arc::new(SessionLocks::new());
        let exec = TurnExecutor::new(
            RuntimeHandle::new(factory, RuntimeOptions::default()),
            store.clone(),
            approvals.clone(),
            locks.clone(),
        );
        Fixture {
            exec,
            store,
            approvals,
            locks,
        }
    }

    fn scripted(backend: ScriptedBackend) -> Fixture {
        fixture(Arc::new(StaticFactory::new(Arc::new(backend))))
    }

    #[tokio::test]
    async fn test_run_turn_commits_canonical_history() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));

        for i in 0..3 {
            let msg = format!("msg {i}");
            let result = f.exec.run_turn("s1", &msg, TurnContext::new("s1")).await.unwrap();
            assert_eq!(result.final_output, format!("Echo: {msg}"));
            assert_eq!(result.agent, "Support");
        }

        let history = f.store.get("s1").await;
        assert_eq!(history.len(), 6);
        assert_eq!(history[4], Message::user("msg 2"));
        assert_eq!(history[5], Message::assistant("Echo: msg 2"));
    }

    #[tokio::test]
    async fn test_store_trusts_runtime_history() {
        let canonical = vec![Message::system("summary of earlier turns"), Message::assistant("Hi")];
        let f = scripted(ScriptedBackend::replying("Support", &["Hi"], canonical.clone()));
        f.store.append("s1", vec![Message::user("old")]).await;

        f.exec.run_turn("s1", "hello", TurnContext::new("s1")).await.unwrap();
        assert_eq!(f.store.get("s1").await, canonical);
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_committed() {
        let f = scripted(ScriptedBackend::new("Support", vec![Err("model error".to_string())]));
        f.store.append("s1", vec![Message::user("before")]).await;

        let err = f.exec.run_turn("s1", "hi", TurnContext::new("s1")).await.unwrap_err();
        assert!(matches!(err, AgentError::TurnExecution(ref m) if m == "model error"));
        assert_eq!(f.store.get("s1").await, vec![Message::user("before")]);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        let err = f.exec.run_turn("s1", "  ", TurnContext::new("s1")).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert!(f.exec.run_turn_streamed("", "hi", TurnContext::default()).is_err());
    }

    #[tokio::test]
    async fn test_streamed_turn_events_and_commit() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        let events: Vec<_> = f
            .exec
            .run_turn_streamed("s1", "Hello", TurnContext::new("s1"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events[0], Ok(TurnEvent::TextDelta { delta: "Echo:".into() }));
        assert_eq!(events[1], Ok(TurnEvent::TextDelta { delta: " Hello".into() }));
        match events.last() {
            Some(Ok(TurnEvent::Final(r))) => assert_eq!(r.final_output, "Echo: Hello"),
            other => panic!("unexpected last event: {other:?}"),
        }
        assert_eq!(
            f.store.get("s1").await,
            vec![Message::user("Hello"), Message::assistant("Echo: Hello")]
        );
    }

    #[tokio::test]
    async fn test_streamed_error_is_not_committed() {
        let f = scripted(ScriptedBackend::new(
            "Support",
            vec![
                Ok(RuntimeEvent::TextDelta { delta: "partial".into() }),
                Err("tool crashed".to_string()),
            ],
        ));
        let events: Vec<_> = f
            .exec
            .run_turn_streamed("s1", "hi", TurnContext::new("s1"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(AgentError::TurnExecution(_))));
        assert!(f.store.get("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_not_committed_and_releases_lock() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        let mut events = f
            .exec
            .run_turn_streamed("s1", "Hello", TurnContext::new("s1"))
            .unwrap();
        assert!(matches!(events.next().await, Some(Ok(TurnEvent::TextDelta { .. }))));
        drop(events);

        assert!(f.store.get("s1").await.is_empty());
        // 锁已释放，下一轮可立即执行
        f.exec.run_turn("s1", "again", TurnContext::new("s1")).await.unwrap();
        assert_eq!(f.store.get("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_session_cleared_during_streamed_turn() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        let mut first = f
            .exec
            .run_turn_streamed("s", "first", TurnContext::new("s"))
            .unwrap();
        assert!(matches!(first.next().await, Some(Ok(TurnEvent::TextDelta { .. }))));

        f.store.clear("s").await;
        f.approvals.clear("s");
        assert!(!f.locks.remove("s"));

        // 第一轮仍持有会话锁，同一 session 的下一轮必须等待
        let waiting = tokio::time::timeout(
            Duration::from_millis(200),
            f.exec.run_turn("s", "second", TurnContext::new("s")),
        )
        .await;
        assert!(waiting.is_err());

        let rest: Vec<_> = first.collect().await;
        match rest.last() {
            Some(Ok(TurnEvent::Final(r))) => assert_eq!(r.final_output, "Echo: first"),
            other => panic!("unexpected last event: {other:?}"),
        }
        assert!(f.store.get("s").await.is_empty());
        assert_eq!(f.store.count().await, 0);

        f.exec.run_turn("s", "second", TurnContext::new("s")).await.unwrap();
        assert_eq!(
            f.store.get("s").await,
            vec![Message::user("second"), Message::assistant("Echo: second")]
        );
    }

    #[tokio::test]
    async fn test_session_cleared_during_blocking_turn() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        f.exec.run_turn("s", "one", TurnContext::new("s")).await.unwrap();

        let guard = f.locks.acquire("s").await;
        let exec = f.exec.clone();
        let pending =
            tokio::spawn(async move { exec.run_turn("s", "two", TurnContext::new("s")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 等待中的轮次尚未读取历史；此时清除，它读到的是新代数
        f.store.clear("s").await;
        drop(guard);
        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.final_output, "Echo: two");
        assert_eq!(
            f.store.get("s").await,
            vec![Message::user("two"), Message::assistant("Echo: two")]
        );
    }

    #[tokio::test]
    async fn test_tool_call_requiring_approval_is_recorded() {
        let f = scripted(ScriptedBackend::new(
            "Support",
            vec![
                Ok(RuntimeEvent::ToolCallStarted {
                    name: "refundOrder".into(),
                    args: json!({"orderId": "42"}),
                    requires_approval: true,
                }),
                Ok(RuntimeEvent::AgentHandoff { agent: "Billing".into() }),
                Ok(RuntimeEvent::Finished(RunOutput {
                    final_output: "done".into(),
                    history: vec![Message::assistant("done")],
                    last_agent: "Billing".into(),
                    raw_usage: vec![Usage::new(3, 4), Usage::new(1, 1)],
                })),
            ],
        ));

        let events: Vec<_> = f
            .exec
            .run_turn_streamed("s1", "refund please", TurnContext::new("s1"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(f.approvals.lookup("s1").as_deref(), Some("refundOrder"));
        assert_eq!(events[1], Ok(TurnEvent::AgentUpdated { agent: "Billing".into() }));
        match &events[2] {
            Ok(TurnEvent::Final(r)) => {
                assert_eq!(r.agent, "Billing");
                assert_eq!(r.usage.requests, 2);
                assert_eq!(r.usage.total_tokens, 9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_unavailable_surfaces_in_stream() {
        let f = fixture(Arc::new(EchoFactory::new("Support")));
        f.exec.runtime.shutdown();
        let events: Vec<_> = f
            .exec
            .run_turn_streamed("s1", "hi", TurnContext::new("s1"))
            .unwrap()
            .collect()
            .await;
        assert_eq!(events, vec![Err(AgentError::RuntimeUnavailable)]);
    }

    /// 工具调用后迟迟不返回的后端
    struct StallingBackend;

    #[async_trait]
    impl AgentBackend for StallingBackend {
        fn identity(&self) -> &str {
            "Staller"
        }

        async fn run(&self, _input: &[Message], _ctx: &TurnContext) -> Result<RunOutput, String> {
            futures_util::future::pending().await
        }

        async fn run_streamed(
            &self,
            _input: &[Message],
            _ctx: &TurnContext,
        ) -> Result<RuntimeEventStream, String> {
            let first = stream::iter(vec![Ok(RuntimeEvent::ToolCallStarted {
                name: "slowTool".into(),
                args: json!({}),
                requires_approval: false,
            })]);
            Ok(Box::pin(first.chain(stream::pending())))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout_enforced() {
        let f = fixture(Arc::new(StaticFactory::new(Arc::new(StallingBackend))));
        let exec = f.exec.with_timeouts(Duration::from_secs(120), Duration::from_secs(30));

        let started = Instant::now();
        let events: Vec<_> = exec
            .run_turn_streamed("s1", "hi", TurnContext::new("s1"))
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events[0], Ok(TurnEvent::ToolCall { .. })));
        assert_eq!(events[1], Err(AgentError::TurnTimeout(30)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_turn_timeout_enforced() {
        let f = fixture(Arc::new(StaticFactory::new(Arc::new(StallingBackend))));
        let exec = f.exec.with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
        let err = exec.run_turn("s1", "hi", TurnContext::new("s1")).await.unwrap_err();
        assert_eq!(err, AgentError::TurnTimeout(5));
        assert!(f.store.get("s1").await.is_empty());
    }
}
