//! OpenAI 兼容 Runtime
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），把 Agent 指令作为 system 消息前置。
//! 流式模式把 chat completion chunk 翻译为 RuntimeEvent；工具业务逻辑不在本服务内实现。

use std::pin::Pin;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionStreamOptions, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};

use super::traits::{
    AgentBackend, BackendFactory, RunOutput, RuntimeEvent, RuntimeEventStream, TurnContext, Usage,
};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::memory::{Message, Role};

/// OpenAI 兼容后端：持有 Client、模型名与 Agent 指令
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
    agent_name: String,
    instructions: String,
}

impl OpenAiBackend {
    pub fn new(
        base_url: Option<&str>,
        api_key: &str,
        model: &str,
        agent_name: &str,
        instructions: &str,
    ) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            agent_name: agent_name.to_string(),
            instructions: instructions.to_string(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, String> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !self.instructions.is_empty() {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(self.instructions.clone())
                    .build()
                    .map_err(|e| e.to_string())?,
            ));
        }
        for m in messages {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| e.to_string())?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| e.to_string())?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(|e| e.to_string())?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }

    /// 流式请求要求最后附带 usage chunk，否则 response_completed 的用量恒为 0
    fn request(&self, messages: &[Message], streaming: bool) -> Result<CreateChatCompletionRequest, String> {
        let mut request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .stream(streaming)
            .build()
            .map_err(|e| e.to_string())?;
        if streaming {
            request.stream_options = Some(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            });
        }
        Ok(request)
    }

    fn finish(&self, input: &[Message], reply: String, usage: Vec<Usage>) -> RunOutput {
        let mut history = input.to_vec();
        history.push(Message::assistant(reply.clone()));
        RunOutput {
            final_output: reply,
            history,
            last_agent: self.agent_name.clone(),
            raw_usage: usage,
        }
    }
}

/// 单个 chunk 中本服务关心的部分
struct ChunkParts {
    deltas: Vec<String>,
    usage: Option<Usage>,
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkParts, String>> + Send>>;

/// 流式翻译状态
struct StreamState {
    upstream: ChunkStream,
    input: Vec<Message>,
    text: String,
    usage: Option<Usage>,
    agent_name: String,
    pending: Vec<RuntimeEvent>,
    done: bool,
}

#[async_trait]
impl AgentBackend for OpenAiBackend {
    fn identity(&self) -> &str {
        &self.agent_name
    }

    async fn run(&self, input: &[Message], _ctx: &TurnContext) -> Result<RunOutput, String> {
        let request = self.request(input, false)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(self.finish(input, content, vec![usage]))
    }

    async fn run_streamed(
        &self,
        input: &[Message],
        _ctx: &TurnContext,
    ) -> Result<RuntimeEventStream, String> {
        let request = self.request(input, true)?;
        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| e.to_string())?;
        let upstream: ChunkStream = Box::pin(upstream.map(|item| {
            item.map_err(|e| e.to_string()).map(|chunk| ChunkParts {
                usage: chunk
                    .usage
                    .as_ref()
                    .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64)),
                deltas: chunk
                    .choices
                    .into_iter()
                    .filter_map(|c| c.delta.content)
                    .filter(|d| !d.is_empty())
                    .collect(),
            })
        }));

        let state = StreamState {
            upstream,
            input: input.to_vec(),
            text: String::new(),
            usage: None,
            agent_name: self.agent_name.clone(),
            pending: Vec::new(),
            done: false,
        };

        let events = stream::unfold(state, |mut st| async move {
            loop {
                if !st.pending.is_empty() {
                    let ev = st.pending.remove(0);
                    return Some((Ok(ev), st));
                }
                if st.done {
                    return None;
                }
                match st.upstream.next().await {
                    Some(Ok(parts)) => {
                        if parts.usage.is_some() {
                            st.usage = parts.usage;
                        }
                        for delta in parts.deltas {
                            st.text.push_str(&delta);
                            st.pending.push(RuntimeEvent::TextDelta { delta });
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                    None => {
                        st.done = true;
                        let usage = st.usage.unwrap_or_default();
                        let mut history = std::mem::take(&mut st.input);
                        history.push(Message::assistant(st.text.clone()));
                        st.pending.push(RuntimeEvent::MessageCreated {
                            content: st.text.clone(),
                        });
                        st.pending.push(RuntimeEvent::ResponseCompleted { usage });
                        st.pending.push(RuntimeEvent::Finished(RunOutput {
                            final_output: std::mem::take(&mut st.text),
                            history,
                            last_agent: st.agent_name.clone(),
                            raw_usage: vec![usage],
                        }));
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

/// OpenAI 后端构造器；缺少凭据视为配置错误（不重试）
pub struct OpenAiFactory {
    base_url: Option<String>,
    api_key: Option<String>,
    model: String,
    agent_name: String,
    instructions: String,
}

impl OpenAiFactory {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            base_url: cfg.runtime.base_url.clone(),
            api_key: cfg.runtime.api_key.clone(),
            model: cfg.runtime.model.clone(),
            agent_name: cfg.agent.name.clone(),
            instructions: cfg.agent.instructions.clone(),
        }
    }
}

#[async_trait]
impl BackendFactory for OpenAiFactory {
    async fn create(&self) -> Result<Arc<dyn AgentBackend>, AgentError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AgentError::Config("OPENAI_API_KEY is not set".to_string()))?;
        if self.model.trim().is_empty() {
            return Err(AgentError::Config("model identifier is empty".to_string()));
        }
        Ok(Arc::new(OpenAiBackend::new(
            self.base_url.as_deref(),
            api_key,
            &self.model,
            &self.agent_name,
            &self.instructions,
        )))
    }
}
