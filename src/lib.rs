//! # 动物识别提交与同步流水线 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                调用方（界面 / 服务入口）                   │
//! │        submit(ImageSource)        load_next / snapshot   │
//! └───────────┼──────────────────────────────────┼───────────┘
//!             ↓                                  ↓
//! ┌───────────┼──────────────────────────────────┼───────────┐
//! │  ┌─ submission ── SubmissionPipeline        history     │
//! │  │   ├─ loader / resize   读取·校验·降采样   HistoryCursor│
//! │  │   ├─ InferenceClient   Gemini 推理+重试      ↑        │
//! │  │   ├─ RecordStore       写入一次          refresh 信号 │
//! │  │   └─ NotificationSink  终态事件 ─────────────┘        │
//! │  │                                                       │
//! │  ├─ store ─────── Firestore REST / SQLite (rusqlite)     │
//! │  ├─ inference ─── Gemini generateContent (reqwest)       │
//! │  ├─ record ────── AnalysisFields / AnalysisRecord        │
//! │  └─ config / error / logging / session                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`record`] | 分析结果数据模型与字段校验 |
//! | [`inference`] | 图片分类客户端 trait 与 Gemini 实现 |
//! | [`store`] | 记录存储 trait、游标分页、Firestore / SQLite 实现 |
//! | [`submission`] | 提交流水线：状态机、重试退避、超时、通知 |
//! | [`history`] | 增量分页读取与头部刷新 |
//! | [`config`] | 配置文件、环境变量覆盖与校验 |
//! | [`session`] | 按配置装配全部组件 |

pub mod config;
pub mod error;
pub mod history;
pub mod inference;
pub mod logging;
pub mod media;
pub mod record;
pub mod session;
pub mod store;
pub mod submission;

mod backoff;

#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use error::AppError;
pub use history::{HistoryCursor, LoadResult};
pub use record::{AnalysisFields, AnalysisRecord};
pub use session::Session;
pub use submission::{ImageSource, SubmissionPipeline, SubmitError};
