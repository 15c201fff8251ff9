//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 各层有自己的错误类型（`InputError` / `InferenceError` / `PersistenceError` /
//! `SubmitError`），`AppError` 只承载启动装配与配置相关的失败，
//! 并为各层错误提供 `From` 转换，便于在应用入口统一 `?`。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 实现 `Serialize` 将错误序列化为字符串，方便界面桥接层直接返回。

use serde::Serialize;

use crate::inference::InferenceError;
use crate::store::PersistenceError;
use crate::submission::SubmitError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 配置缺失或取值非法
    #[error("配置错误: {0}")]
    Config(String),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 推理客户端初始化失败
    #[error("{0}")]
    Inference(#[from] InferenceError),

    /// 存储初始化或读取失败
    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// 提交流水线失败
    #[error("{0}")]
    Submit(#[from] SubmitError),
}

/// 将错误序列化为人类可读的字符串。
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;
    use crate::submission::SubmitError;

    #[test]
    fn serializes_as_message_string() {
        let value = serde_json::to_value(AppError::Config("缺少 Gemini API Key".into())).expect("serialize");
        assert_eq!(value, "配置错误: 缺少 Gemini API Key");

        let value = serde_json::to_value(AppError::from(SubmitError::Busy)).expect("serialize");
        assert_eq!(value, "已有提交正在处理中");
    }
}
