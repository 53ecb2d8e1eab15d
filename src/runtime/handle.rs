//! Runtime 句柄：进程内唯一的外部 Runtime 引用
//!
//! 状态机：Uninitialized → Initializing →（重试中 Degraded）→ Ready → ShuttingDown。
//! - 同一时刻最多一个初始化序列在进行；并发调用者共享同一次尝试的结果
//! - Ready 后的读取只取一次读锁，不与初始化互斥
//! - Ready 期间按固定间隔做健康检查，失败则清空实例，下次使用时重新初始化
//! - shutdown 会打断正在退避等待的初始化序列

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::traits::{AgentBackend, BackendFactory};
use crate::config::AppConfig;
use crate::core::{AgentError, Backoff, RecoveryAction};

/// 句柄状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    Ready,
    /// 初始化序列中至少一次尝试已失败，正在退避重试
    Degraded,
    ShuttingDown,
}

/// 初始化与健康检查参数
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub health_check_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(10_000),
            health_check_interval: Duration::from_secs(300),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_retries: cfg.runtime.max_init_retries,
            backoff_base: Duration::from_millis(cfg.runtime.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.runtime.backoff_max_ms),
            health_check_interval: cfg.runtime.health_check_interval(),
        }
    }
}

type InitResult = Result<Arc<dyn AgentBackend>, AgentError>;
type InitFuture = Shared<BoxFuture<'static, InitResult>>;

struct Slot {
    state: RuntimeState,
    instance: Option<Arc<dyn AgentBackend>>,
    last_health_check: Option<DateTime<Utc>>,
    health_token: Option<CancellationToken>,
}

struct Inner {
    factory: Arc<dyn BackendFactory>,
    options: RuntimeOptions,
    slot: RwLock<Slot>,
    inflight: Mutex<Option<InitFuture>>,
    /// shutdown 时取消
    closing: CancellationToken,
}

/// Runtime 句柄（可克隆，共享同一内部状态）
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<Inner>,
}

impl RuntimeHandle {
    pub fn new(factory: Arc<dyn BackendFactory>, options: RuntimeOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                slot: RwLock::new(Slot {
                    state: RuntimeState::Uninitialized,
                    instance: None,
                    last_health_check: None,
                    health_token: None,
                }),
                inflight: Mutex::new(None),
                closing: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.read_slot().state
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.inner.read_slot().last_health_check
    }

    /// 返回就绪实例；未初始化时触发初始化，初始化中则等待同一次尝试
    pub async fn get_runtime(&self) -> InitResult {
        {
            let slot = self.inner.read_slot();
            match (slot.state, slot.instance.as_ref()) {
                (RuntimeState::Ready, Some(instance)) => return Ok(Arc::clone(instance)),
                (RuntimeState::ShuttingDown, _) => return Err(AgentError::RuntimeUnavailable),
                _ => {}
            }
        }
        self.initialize().await
    }

    /// 启动（或加入）初始化序列，按配置的次数做指数退避重试
    pub async fn initialize(&self) -> InitResult {
        let attempt = {
            let mut inflight = self.inner.lock_inflight();
            {
                let mut slot = self.inner.write_slot();
                match (slot.state, slot.instance.as_ref()) {
                    (RuntimeState::Ready, Some(instance)) => return Ok(Arc::clone(instance)),
                    (RuntimeState::ShuttingDown, _) => return Err(AgentError::RuntimeUnavailable),
                    _ => {}
                }
                if inflight.is_none() {
                    slot.state = RuntimeState::Initializing;
                }
            }
            match inflight.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let task = tokio::spawn(Inner::run_init(Arc::clone(&self.inner)));
                    let fut: BoxFuture<'static, InitResult> = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(AgentError::RuntimeInit {
                                attempts: 0,
                                reason: format!("initialization task aborted: {e}"),
                            }),
                        }
                    }
                    .boxed();
                    let shared = fut.shared();
                    *inflight = Some(shared.clone());
                    shared
                }
            }
        };
        attempt.await
    }

    /// 立即执行一次健康检查；失败时清空实例并回到 Uninitialized
    pub async fn health_check(&self) -> bool {
        self.inner.check_health().await
    }

    /// 转入 ShuttingDown，取消健康检查并释放实例；可重复调用
    pub fn shutdown(&self) {
        let mut slot = self.inner.write_slot();
        if slot.state == RuntimeState::ShuttingDown {
            return;
        }
        slot.state = RuntimeState::ShuttingDown;
        slot.instance = None;
        if let Some(token) = slot.health_token.take() {
            token.cancel();
        }
        self.inner.closing.cancel();
        tracing::info!("Agent runtime shut down");
    }
}

impl Inner {
    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Option<InitFuture>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_init(inner: Arc<Inner>) -> InitResult {
        let opts = &inner.options;
        let mut backoff = Backoff::new(opts.backoff_base, opts.backoff_max, opts.max_retries);

        let outcome = loop {
            if inner.closing.is_cancelled() {
                break Err(AgentError::RuntimeUnavailable);
            }
            let Some(attempt) = backoff.next_attempt() else {
                break Err(AgentError::RuntimeInit {
                    attempts: backoff.attempts(),
                    reason: "no initialization attempts configured".to_string(),
                });
            };
            tracing::info!(attempt, max = opts.max_retries, "Initializing agent runtime");

            match inner.factory.create().await {
                Ok(instance) => break Ok(instance),
                Err(err) => match backoff.on_failure(&err) {
                    RecoveryAction::RetryAfter(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Agent runtime initialization failed, retrying"
                        );
                        {
                            let mut slot = inner.write_slot();
                            if slot.state != RuntimeState::ShuttingDown {
                                slot.state = RuntimeState::Degraded;
                            }
                        }
                        let interrupted = tokio::select! {
                            biased;
                            _ = inner.closing.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        };
                        if interrupted {
                            tracing::info!(attempt, "Shutdown during initialization backoff");
                            break Err(AgentError::RuntimeUnavailable);
                        }
                    }
                    RecoveryAction::Abort => {
                        tracing::error!(attempt, error = %err, "Agent runtime initialization gave up");
                        break Err(match err {
                            AgentError::Config(_) => err,
                            other => AgentError::RuntimeInit {
                                attempts: attempt,
                                reason: other.to_string(),
                            },
                        });
                    }
                },
            }
        };

        let outcome = {
            let mut slot = inner.write_slot();
            if slot.state == RuntimeState::ShuttingDown {
                Err(AgentError::RuntimeUnavailable)
            } else {
                match outcome {
                    Ok(instance) => {
                        slot.state = RuntimeState::Ready;
                        slot.instance = Some(Arc::clone(&instance));
                        slot.last_health_check = Some(Utc::now());
                        if let Some(old) = slot.health_token.take() {
                            old.cancel();
                        }
                        slot.health_token = Some(Inner::spawn_health_loop(&inner));
                        tracing::info!(agent = instance.identity(), "Agent runtime ready");
                        Ok(instance)
                    }
                    Err(e) => {
                        slot.state = RuntimeState::Uninitialized;
                        slot.instance = None;
                        Err(e)
                    }
                }
            }
        };
        *inner.lock_inflight() = None;
        outcome
    }

    fn spawn_health_loop(inner: &Arc<Inner>) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let period = inner.options.health_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                if !inner.check_health().await {
                    break;
                }
            }
        });
        token
    }

    async fn check_health(&self) -> bool {
        let instance = {
            let slot = self.read_slot();
            match (slot.state, slot.instance.as_ref()) {
                (RuntimeState::Ready, Some(instance)) => Arc::clone(instance),
                _ => return false,
            }
        };

        let healthy = instance.health_check().await;

        let mut slot = self.write_slot();
        let same = slot
            .instance
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &instance));
        if !same {
            return healthy;
        }
        if healthy {
            slot.last_health_check = Some(Utc::now());
            tracing::debug!("Agent runtime health check passed");
        } else {
            tracing::warn!("Agent runtime health check failed, dropping instance");
            slot.state = RuntimeState::Uninitialized;
            slot.instance = None;
            if let Some(token) = slot.health_token.take() {
                token.cancel();
            }
        }
        healthy
    }
}
