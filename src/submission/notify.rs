//! # 通知模块
//!
//! 每次提交（或持久化重试）结束时，流水线向 `NotificationSink` 发出且只发出一条
//! 终态事件；状态迁移通过可选的 `on_state` 回调观察。

use serde::Serialize;

use super::error::{Stage, SubmitError};
use crate::record::AnalysisRecord;

/// 流水线状态。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Reading,
    Inferring,
    Persisting,
    Succeeded,
    Failed {
        stage: Stage,
        code: &'static str,
        message: String,
    },
}

impl PipelineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// 提交终态事件。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionEvent {
    Success {
        record: AnalysisRecord,
    },
    Failure {
        stage: Stage,
        code: &'static str,
        message: String,
    },
}

impl SubmissionEvent {
    /// 由已进入某阶段的失败构造事件；`Busy` 等未进入阶段的错误返回 `None`。
    pub(crate) fn from_error(error: &SubmitError) -> Option<Self> {
        error.stage().map(|stage| Self::Failure {
            stage,
            code: error.code(),
            message: error.to_string(),
        })
    }
}

/// 终态事件接收方（界面提示、推送等）。
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &SubmissionEvent);

    /// 状态迁移回调，默认忽略。
    fn on_state(&self, _state: &PipelineState) {}
}

/// 只写日志的接收方。
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &SubmissionEvent) {
        match event {
            SubmissionEvent::Success { record } => log::info!(
                "🔔 分析完成 - id: {} {} / {} 约 {}kg",
                record.id,
                record.fields.animal_kind,
                record.fields.breed,
                record.fields.estimated_weight
            ),
            SubmissionEvent::Failure { stage, code, message } => {
                log::warn!("🔔 分析失败 - stage: {} code: {} {}", stage.as_str(), code, message)
            }
        }
    }
}
