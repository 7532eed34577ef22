//! Autopilot - 目标驱动的长期运行智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 目标、任务规划与优先级队列、限流防护、派发、错误恢复、Worker 监管、幂等账本
//! - **observability**: 日志初始化
//!
//! 与外部平台的交互（申请、发帖、回复消息……）由宿主以 `TaskHandler` 形式注入。

pub mod config;
pub mod core;
pub mod observability;
