//! 核心：错误类型、初始化重试策略、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::AgentError;
pub use recovery::{Backoff, RecoveryAction};
pub use shutdown::{
    RuntimeCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
