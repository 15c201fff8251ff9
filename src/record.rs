//! # 分析记录模型
//!
//! ## 设计思路
//!
//! 用两个类型区分记录的生命周期，而不是用 `Option<id>` 表达“是否已持久化”：
//! - `AnalysisFields`：模型解析出的六个分类字段，尚未持久化
//! - `AnalysisRecord`：由存储层分配 `id` 与 `created_at` 后的不可变记录
//!
//! 字段在线上（模型响应 / 文档存储）使用与前端一致的 camelCase 命名，
//! 其中动物种类字段名为 `animal`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 模型输出中必须出现的字段名（与响应 schema 的 `required` 一致）。
pub const REQUIRED_FIELDS: [&str; 6] = [
    "animal",
    "breed",
    "bodyType",
    "frameType",
    "estimatedWeight",
    "weightRange",
];

/// 字段校验失败原因。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("字段 {0} 不能为空")]
    EmptyField(&'static str),

    #[error("estimatedWeight 必须为有限正数，实际为 {0}")]
    InvalidWeight(f64),
}

/// 一次图片分类的结果（未持久化）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisFields {
    #[serde(rename = "animal")]
    pub animal_kind: String,
    pub breed: String,
    pub body_type: String,
    pub frame_type: String,
    /// 估算体重（kg）。
    pub estimated_weight: f64,
    pub weight_range: String,
}

impl AnalysisFields {
    /// 校验字段语义：文本非空白，体重为有限正数。
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let texts = [
            ("animal", &self.animal_kind),
            ("breed", &self.breed),
            ("bodyType", &self.body_type),
            ("frameType", &self.frame_type),
            ("weightRange", &self.weight_range),
        ];
        for (name, value) in texts {
            if value.trim().is_empty() {
                return Err(SchemaViolation::EmptyField(name));
            }
        }

        if !self.estimated_weight.is_finite() || self.estimated_weight <= 0.0 {
            return Err(SchemaViolation::InvalidWeight(self.estimated_weight));
        }

        Ok(())
    }
}

/// 已持久化的分析记录。
///
/// 只能由 `RecordStore` 构造出有效的 `id` / `created_at`，此后不可修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: AnalysisFields,
    pub created_at: DateTime<Utc>,
}
