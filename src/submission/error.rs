//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 流水线的失败按阶段分层：读取阶段 `InputError`、推理阶段 `InferenceError`、
//! 持久化阶段 `PersistenceError`，再由 `SubmitError` 统一承载并附带稳定的
//! `stage` / `code` 标签，供通知与前端展示使用。

use serde::Serialize;

use crate::inference::InferenceError;
use crate::store::PersistenceError;

/// 读取阶段错误：均为用户可修正的问题，不会重试。
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("图片内容为空")]
    Empty,

    #[error("不支持的图片类型：{0}（可选：image/jpeg / image/png / image/webp）")]
    UnsupportedMime(String),

    #[error("无法读取图片：{0}")]
    Unreadable(String),

    #[error("资源限制：{0}")]
    TooLarge(String),

    #[error("文件错误：{0}")]
    FileSystem(String),

    #[error("解码错误：{0}")]
    Decode(String),
}

impl InputError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Empty => "E_INPUT_EMPTY",
            Self::UnsupportedMime(_) => "E_INPUT_UNSUPPORTED_MIME",
            Self::Unreadable(_) => "E_INPUT_UNREADABLE",
            Self::TooLarge(_) => "E_INPUT_TOO_LARGE",
            Self::FileSystem(_) => "E_INPUT_FILE",
            Self::Decode(_) => "E_INPUT_DECODE",
        }
    }
}

/// 流水线阶段标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Reading,
    Inferring,
    Persisting,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Inferring => "inferring",
            Self::Persisting => "persisting",
        }
    }
}

/// 一次提交（或持久化重试）的失败原因。
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Input(#[from] InputError),

    #[error("{0}")]
    Inference(#[from] InferenceError),

    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// 已有提交在处理中，本次调用被拒绝（不排队）。
    #[error("已有提交正在处理中")]
    Busy,

    #[error("没有等待重新保存的分析结果")]
    NothingToRetry,

    /// 后台处理任务在给出结果前被取消（运行时关闭）。
    #[error("处理任务被中断：{0}")]
    Interrupted(String),
}

impl SubmitError {
    /// 失败所在阶段；`Busy` / `NothingToRetry` / `Interrupted` 不对应任何阶段。
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Input(_) => Some(Stage::Reading),
            Self::Inference(_) => Some(Stage::Inferring),
            Self::Persistence(_) => Some(Stage::Persisting),
            Self::Busy | Self::NothingToRetry | Self::Interrupted(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(e) => e.code(),
            Self::Inference(e) => e.code(),
            Self::Persistence(e) => e.code(),
            Self::Busy => "E_BUSY",
            Self::NothingToRetry => "E_NOTHING_TO_RETRY",
            Self::Interrupted(_) => "E_INTERRUPTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_and_code_follow_the_wrapped_error() {
        let empty = SubmitError::from(InputError::Empty);
        assert_eq!(empty.stage(), Some(Stage::Reading));
        assert_eq!(empty.code(), "E_INPUT_EMPTY");

        let schema = SubmitError::from(InferenceError::Schema("breed".into()));
        assert_eq!(schema.stage(), Some(Stage::Inferring));
        assert_eq!(schema.code(), "E_INFERENCE_SCHEMA");

        let timeout = SubmitError::from(PersistenceError::Timeout("15s".into()));
        assert_eq!(timeout.stage().map(Stage::as_str), Some("persisting"));

        assert_eq!(SubmitError::Busy.stage(), None);
        assert_eq!(SubmitError::Busy.code(), "E_BUSY");
    }

    #[test]
    fn stage_serializes_lowercase() {
        let value = serde_json::to_value(Stage::Inferring).expect("serialize stage");
        assert_eq!(value, "inferring");
    }
}
