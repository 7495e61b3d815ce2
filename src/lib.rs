//! Agent Bridge - 外部智能体桥接核心
//!
//! 把不可靠的发布/订阅协议桥接到异步任务协议：保持请求/回复关联，
//! 处理多步任务生命周期（含「等待补充输入」暂停），并监管可能崩溃的后端进程。
//!
//! 模块划分：
//! - **transport**: 发布/订阅抽象与进程内 broker
//! - **supervisor**: 后端进程监管（launch 拉起并重启 / connect 连接现有 URL）
//! - **correlation**: token → 一次性等待槽位
//! - **pending**: 暂停任务的 TTL 存储（内存 / SQLite）
//! - **task**: 内容片段、线协议、远端任务登记表
//! - **actions**: 动作定义、参数绑定、回复格式
//! - **lifecycle**: 任务生命周期控制器
//! - **bridge**: 运行时装配与后台任务
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭

pub mod actions;
pub mod bridge;
pub mod config;
pub mod core;
pub mod correlation;
pub mod lifecycle;
pub mod observability;
pub mod pending;
pub mod supervisor;
pub mod task;
pub mod transport;

pub use bridge::{Bridge, BridgeBuilder, BridgeCleanup};
pub use core::BridgeError;
pub use lifecycle::{FollowUpInput, InvokeRequest, TaskOutcome};
