//! # 推理客户端模块（inference）
//!
//! ## 设计思路
//!
//! 把“图片 → 结构化分类结果”抽象为 `InferenceClient` trait，
//! 流水线只依赖该 trait，具体模型（当前为 Gemini）通过构造参数注入。
//!
//! 本层只负责发出一次请求并解析结果，**不做重试**：
//! 是否重试由流水线根据 `InferenceError::is_transient` 决定。

use async_trait::async_trait;

use crate::media::ImageMime;
use crate::record::{AnalysisFields, SchemaViolation};

mod gemini;

pub use gemini::{GeminiClient, GeminiConfig};

/// 推理阶段错误。
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("网络错误：{0}")]
    Transport(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("模型服务返回 HTTP {status}：{message}")]
    Status {
        status: u16,
        message: String,
        /// 服务端 `Retry-After` 提示（毫秒）。
        retry_after_ms: Option<u64>,
    },

    #[error("响应格式错误：{0}")]
    MalformedResponse(String),

    #[error("响应字段不符合 schema：{0}")]
    Schema(String),

    #[error("推理配置错误：{0}")]
    Config(String),
}

impl InferenceError {
    /// 是否属于可重试的瞬时失败。
    ///
    /// 解析 / schema 错误对同一输入是确定性的，重试没有意义。
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => is_retryable_http_status(*status),
            Self::MalformedResponse(_) | Self::Schema(_) | Self::Config(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "E_INFERENCE_NETWORK",
            Self::Timeout(_) => "E_INFERENCE_TIMEOUT",
            Self::Status { .. } => "E_INFERENCE_STATUS",
            Self::MalformedResponse(_) => "E_INFERENCE_MALFORMED",
            Self::Schema(_) => "E_INFERENCE_SCHEMA",
            Self::Config(_) => "E_INFERENCE_CONFIG",
        }
    }

    pub(crate) fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Status { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<SchemaViolation> for InferenceError {
    fn from(violation: SchemaViolation) -> Self {
        Self::Schema(violation.to_string())
    }
}

pub(crate) fn is_retryable_http_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

/// 图片分类能力。
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// 对一张已校验的图片发起一次分类请求。
    async fn classify(&self, image: &[u8], mime: ImageMime) -> Result<AnalysisFields, InferenceError>;
}
