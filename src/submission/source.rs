//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入类型”和“流水线中间结果”解耦：
//! - `ImageSource` 表示调用方提供的图片来源
//! - `RawImage` 表示已加载但未校验的字节
//! - `PreparedImage` 表示已校验、可直接上传给模型的图片

use std::path::PathBuf;

use bytes::Bytes;

use crate::media::ImageMime;

/// 图片输入来源。
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// 内存字节，附带调用方声明的 MIME（可缺省）。
    Bytes { bytes: Bytes, mime: Option<String> },
    /// Base64（支持 Data URL 与纯 Base64 字符串）。
    Base64(String),
    /// 本地文件路径。
    FilePath(PathBuf),
}

/// 加载阶段输出。
pub(crate) struct RawImage {
    pub(crate) bytes: Bytes,
    /// 来源声明的 MIME（Data URL 前缀或调用方参数）。
    pub(crate) declared_mime: Option<String>,
    /// 来源提示（用于日志与诊断）。
    pub(crate) source_hint: &'static str,
}

/// 读取阶段输出：非空、类型受支持、尺寸在限制内的图片。
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Bytes,
    pub mime: ImageMime,
    pub width: u32,
    pub height: u32,
}
