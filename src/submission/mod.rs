//! # 提交流水线模块（submission）
//!
//! ## 设计思路
//!
//! 该模块将“读取图片 → 模型推理 → 写入存储 → 通知结果”按职责拆分为多个子模块：
//!
//! - `pipeline`：编排整条流水线（状态机、重试、超时、阶段耗时日志）
//! - `loader`：按来源读取字节并校验类型、体积、像素
//! - `resize`：上传前的降采样与 JPEG 重新编码
//! - `notify`：终态事件、状态与通知接收方
//! - `config/error/source`：配置、错误、中间数据模型
//!
//! ## 新同事快速上手
//!
//! ```text
//! submit(ImageSource)
//!    ↓
//! pipeline.rs（Busy 检查 + 状态迁移）
//!    ├─ loader.rs → resize.rs（Reading，阻塞线程池）
//!    ├─ InferenceClient（Inferring，瞬时失败退避重试）
//!    └─ RecordStore（Persisting，只写一次）
//!    ↓
//! NotificationSink 终态事件 + 历史刷新信号
//! ```
//!
//! ## 分层职责建议
//!
//! - 重试与超时策略变更优先改 `config.rs`
//! - 流程顺序与状态机变更优先改 `pipeline.rs`
//! - 输入格式支持变更优先改 `loader.rs` 与 `crate::media`

mod config;
mod error;
mod loader;
mod notify;
mod pipeline;
mod resize;
mod source;

pub use config::{ImageLimits, PipelineConfig};
pub use error::{InputError, Stage, SubmitError};
pub use notify::{LogSink, NotificationSink, PipelineState, SubmissionEvent};
pub use pipeline::SubmissionPipeline;
pub use source::{ImageSource, PreparedImage};
