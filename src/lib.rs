//! Flowdesk - 流式客服对话服务
//!
//! 模块划分：
//! - **agent**: 单轮执行器（阻塞 / 流式）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、初始化退避重试、优雅关闭
//! - **gateway**: 会话互斥、工具审批关联、SSE 事件与连接状态机
//! - **memory**: 会话历史存储
//! - **observability**: tracing 日志初始化
//! - **runtime**: 外部 Agent Runtime 边界、句柄生命周期、OpenAI / Echo 实现
//! - **web**: axum 路由与 handler

pub mod agent;
pub mod config;
pub mod core;
pub mod gateway;
pub mod memory;
pub mod observability;
pub mod runtime;
pub mod web;
