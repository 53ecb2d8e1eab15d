//! SSE 连接状态机
//!
//! Opening → Streaming → Closing → Closed，流式阶段出错时 Streaming → Errored → Closed。
//! 每条连接一个驱动任务：按顺序消费 TurnEventStream，同时按心跳间隔写 heartbeat。
//! 写入前检查 connected 标志；接收端被丢弃即视为客户端断开，之后不再尝试任何写入。
//!
//! 帧格式（逐字节固定，由 axum 的 `sse::Event` 按 id → event → data 的顺序写出）：
//! ```text
//! id: event-<n>
//! event: <name>
//! data: <json>
//!
//! ```
//! 编号约定：connected 握手帧固定为 event-0，不计入轮次事件；轮次事件与心跳从 event-1 起严格递增。
//! 这样一个 [delta, delta, final] 的轮次得到 event-1..event-3，stream_complete 为 event-4。
//! axum 的 KeepAlive 只能发注释行，带编号的 heartbeat 帧由本状态机自己写。

use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::approval::ToolApprovalCorrelator;
use super::message::StreamEvent;
use crate::agent::{TurnEvent, TurnEventStream};

/// 构造一帧；`data` 必须是单行 JSON
pub fn encode_frame(id: u64, event: &str, data: &str) -> Event {
    Event::default()
        .id(format!("event-{id}"))
        .event(event)
        .data(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Streaming,
    Closing,
    Errored,
    Closed,
}

/// 连接结束后的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    /// 依次经过的状态
    pub transitions: Vec<ConnectionState>,
    pub frames_written: u64,
    /// 尝试写入次数（含失败的那次）
    pub write_attempts: u64,
    pub disconnected: bool,
}

pub struct SseConnection {
    session_id: String,
    tx: mpsc::Sender<Event>,
    approvals: Arc<ToolApprovalCorrelator>,
    heartbeat: Duration,
    next_id: u64,
    connected: bool,
    frames_written: u64,
    write_attempts: u64,
    transitions: Vec<ConnectionState>,
}

impl SseConnection {
    pub fn new(
        session_id: impl Into<String>,
        tx: mpsc::Sender<Event>,
        approvals: Arc<ToolApprovalCorrelator>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
            approvals,
            heartbeat,
            next_id: 0,
            connected: true,
            frames_written: 0,
            write_attempts: 0,
            transitions: vec![ConnectionState::Opening],
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        tracing::debug!(session_id = %self.session_id, state = ?to, "SSE connection state");
        self.transitions.push(to);
    }

    fn mark_disconnected(&mut self) {
        if self.connected {
            self.connected = false;
            tracing::info!(session_id = %self.session_id, "SSE client disconnected");
        }
    }

    /// 连接仍在时写一帧；返回是否写入成功
    async fn write(&mut self, event: &StreamEvent) -> bool {
        if !self.connected {
            return false;
        }
        let data = event.payload(&self.session_id).to_string();
        let frame = encode_frame(self.next_id, event.kind(), &data);
        self.write_attempts += 1;
        if self.tx.send(frame).await.is_err() {
            self.mark_disconnected();
            return false;
        }
        self.next_id += 1;
        self.frames_written += 1;
        true
    }

    fn to_stream_event(&self, event: TurnEvent) -> Option<StreamEvent> {
        match event {
            TurnEvent::TextDelta { delta } => Some(StreamEvent::TextDelta { delta }),
            TurnEvent::ToolCall {
                name,
                args,
                requires_approval,
            } => {
                // 以 Runtime 的标记为准；关联记录只决定是否仍在提示窗口内
                let requires_approval = requires_approval
                    && self.approvals.lookup(&self.session_id).as_deref() == Some(name.as_str());
                Some(StreamEvent::ToolCall {
                    tool_name: name,
                    args,
                    requires_approval,
                })
            }
            TurnEvent::MessageCreated { content } => Some(StreamEvent::MessageCreated { content }),
            TurnEvent::AgentUpdated { agent } => Some(StreamEvent::AgentUpdated { agent }),
            TurnEvent::ResponseCompleted { usage } => Some(StreamEvent::ResponseCompleted { usage }),
            TurnEvent::Final(result) => Some(StreamEvent::FinalResult {
                content: result.final_output,
                agent: result.agent,
                usage: result.usage,
            }),
            TurnEvent::Unknown { kind } => {
                tracing::warn!(session_id = %self.session_id, kind = %kind, "Skipping unknown runtime event");
                None
            }
        }
    }

    /// 驱动整条连接直到关闭；`shutdown` 取消时视同断开
    pub async fn run(mut self, mut events: TurnEventStream, shutdown: CancellationToken) -> ConnectionReport {
        tracing::info!(session_id = %self.session_id, "SSE connection opened");

        if self.write(&StreamEvent::Connected).await {
            self.transition(ConnectionState::Streaming);

            let start = tokio::time::Instant::now() + self.heartbeat;
            let mut heartbeat = tokio::time::interval_at(start, self.heartbeat);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let failed = loop {
                tokio::select! {
                    biased;
                    _ = self.tx.closed() => {
                        self.mark_disconnected();
                        break false;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!(session_id = %self.session_id, "Server shutting down, closing SSE connection");
                        self.connected = false;
                        break false;
                    }
                    next = events.next() => match next {
                        Some(Ok(TurnEvent::Final(result))) => {
                            let final_event = self.to_stream_event(TurnEvent::Final(result));
                            if let Some(ev) = final_event {
                                self.write(&ev).await;
                            }
                            self.write(&StreamEvent::StreamComplete).await;
                            break false;
                        }
                        Some(Ok(event)) => {
                            if let Some(ev) = self.to_stream_event(event) {
                                self.write(&ev).await;
                            }
                        }
                        Some(Err(err)) => {
                            self.transition(ConnectionState::Errored);
                            tracing::error!(session_id = %self.session_id, error = %err, "Streaming turn failed");
                            self.write(&StreamEvent::Error { message: err.to_string() }).await;
                            break true;
                        }
                        None => break false,
                    },
                    _ = heartbeat.tick() => {
                        self.write(&StreamEvent::Heartbeat).await;
                    }
                }
                if !self.connected {
                    break false;
                }
            };

            if !failed {
                self.transition(ConnectionState::Closing);
            }
        }

        // 停止心跳并放弃剩余事件
        drop(events);
        self.transition(ConnectionState::Closed);
        tracing::info!(
            session_id = %self.session_id,
            frames = self.frames_written,
            disconnected = !self.connected,
            "SSE connection closed"
        );

        ConnectionReport {
            transitions: self.transitions,
            frames_written: self.frames_written,
            write_attempts: self.write_attempts,
            disconnected: !self.connected,
        }
    }
}
