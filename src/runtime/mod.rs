//! Runtime 层：外部 Agent 编排引擎的边界与生命周期（OpenAI 兼容 / Echo / 脚本）

pub mod handle;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use handle::{RuntimeHandle, RuntimeOptions, RuntimeState};
pub use mock::{EchoBackend, EchoFactory, ScriptedBackend, StaticFactory};
pub use openai::{OpenAiBackend, OpenAiFactory};
pub use traits::{
    AgentBackend, BackendFactory, RunOutput, RuntimeEvent, RuntimeEventStream, TurnContext, Usage,
};

use crate::config::AppConfig;
use crate::core::AgentError;

/// 按配置的 provider 创建构造器
pub fn create_factory(cfg: &AppConfig) -> Result<Arc<dyn BackendFactory>, AgentError> {
    match cfg.runtime.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiFactory::from_config(cfg))),
        "echo" => Ok(Arc::new(EchoFactory::new(cfg.agent.name.clone()))),
        other => Err(AgentError::Config(format!("unknown runtime provider '{other}'"))),
    }
}
