//! Mock Runtime（本地开发与测试，无需 API）
//!
//! - EchoBackend：取最后一条 User 消息，回复 `Echo: <message>`，流式时逐词输出
//! - ScriptedBackend：按预设脚本吐出事件，用于网关与执行器测试
//! - StaticFactory：每次构造都返回同一个后端实例

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;

use super::traits::{
    AgentBackend, BackendFactory, RunOutput, RuntimeEvent, RuntimeEventStream, TurnContext, Usage,
};
use crate::core::AgentError;
use crate::memory::{Message, Role};

/// Echo 客户端：回显用户最后一条消息
#[derive(Debug, Clone)]
pub struct EchoBackend {
    name: String,
}

impl EchoBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn reply_for(input: &[Message]) -> String {
        let last_user = input
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        format!("Echo: {}", last_user)
    }

    fn output_for(&self, input: &[Message]) -> RunOutput {
        let reply = Self::reply_for(input);
        let mut history = input.to_vec();
        history.push(Message::assistant(reply.clone()));
        let usage = Usage::new(
            input.iter().map(|m| m.content.split_whitespace().count() as u64).sum(),
            reply.split_whitespace().count() as u64,
        );
        RunOutput {
            final_output: reply,
            history,
            last_agent: self.name.clone(),
            raw_usage: vec![usage],
        }
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &[Message], _ctx: &TurnContext) -> Result<RunOutput, String> {
        Ok(self.output_for(input))
    }

    async fn run_streamed(
        &self,
        input: &[Message],
        _ctx: &TurnContext,
    ) -> Result<RuntimeEventStream, String> {
        let output = self.output_for(input);
        let mut events: Vec<Result<RuntimeEvent, String>> = Vec::new();
        for (i, word) in output.final_output.split(' ').enumerate() {
            let delta = if i == 0 { word.to_string() } else { format!(" {}", word) };
            events.push(Ok(RuntimeEvent::TextDelta { delta }));
        }
        events.push(Ok(RuntimeEvent::MessageCreated {
            content: output.final_output.clone(),
        }));
        if let Some(usage) = output.raw_usage.first() {
            events.push(Ok(RuntimeEvent::ResponseCompleted { usage: *usage }));
        }
        events.push(Ok(RuntimeEvent::Finished(output)));
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Echo 构造器：记录构造次数
#[derive(Debug, Default)]
pub struct EchoFactory {
    name: String,
    created: AtomicUsize,
}

impl EchoFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendFactory for EchoFactory {
    async fn create(&self) -> Result<Arc<dyn AgentBackend>, AgentError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoBackend::new(self.name.clone())))
    }
}

/// 固定实例构造器
pub struct StaticFactory {
    backend: Arc<dyn AgentBackend>,
}

impl StaticFactory {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendFactory for StaticFactory {
    async fn create(&self) -> Result<Arc<dyn AgentBackend>, AgentError> {
        Ok(Arc::clone(&self.backend))
    }
}

/// 脚本客户端：流式时依次吐出预设事件；阻塞模式返回脚本中的 Finished 结果
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    name: String,
    script: Vec<Result<RuntimeEvent, String>>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>, script: Vec<Result<RuntimeEvent, String>>) -> Self {
        Self {
            name: name.into(),
            script,
        }
    }

    /// 便捷构造：文本增量 + 以给定历史结束
    pub fn replying(name: impl Into<String>, deltas: &[&str], history: Vec<Message>) -> Self {
        let name = name.into();
        let final_output: String = deltas.concat();
        let mut script: Vec<Result<RuntimeEvent, String>> = deltas
            .iter()
            .map(|d| Ok(RuntimeEvent::TextDelta { delta: d.to_string() }))
            .collect();
        script.push(Ok(RuntimeEvent::Finished(RunOutput {
            final_output,
            history,
            last_agent: name.clone(),
            raw_usage: vec![Usage::new(1, 1)],
        })));
        Self { name, script }
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn run(&self, _input: &[Message], _ctx: &TurnContext) -> Result<RunOutput, String> {
        for item in &self.script {
            match item {
                Ok(RuntimeEvent::Finished(output)) => return Ok(output.clone()),
                Err(e) => return Err(e.clone()),
                Ok(_) => {}
            }
        }
        Err("script ended without a final result".to_string())
    }

    async fn run_streamed(
        &self,
        _input: &[Message],
        _ctx: &TurnContext,
    ) -> Result<RuntimeEventStream, String> {
        Ok(Box::pin(stream::iter(self.script.clone())))
    }
}
