//! # 读取阶段模块
//!
//! ## 设计思路
//!
//! 读取阶段只做“拿到字节并确认它是一张可上传的图片”，所有问题都以
//! `InputError` 返回，属于用户可修正的错误，流水线不会重试。
//!
//! ## 实现思路
//!
//! 1. 按来源读取字节（内存 / Base64 / 本地文件），Base64 在解码前先估算体积
//! 2. 拒绝空内容与超限体积
//! 3. 通过文件签名识别真实类型；声明类型与签名不一致时以签名为准
//! 4. 只读取图片头拿到宽高，按像素上限快速拒绝
//! 5. 交给 `resize` 做上传前的降采样 / 重新编码
//!
//! 整个阶段是同步 CPU 工作，由流水线放到阻塞线程池执行。

use std::io::Cursor;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;

use super::config::ImageLimits;
use super::error::InputError;
use super::resize;
use super::source::{ImageSource, PreparedImage, RawImage};
use crate::media::ImageMime;

/// 读取并校验图片，产出可上传的 `PreparedImage`。
pub(crate) fn prepare(source: ImageSource, limits: &ImageLimits) -> Result<PreparedImage, InputError> {
    let raw = load(source, limits)?;
    let source_hint = raw.source_hint;

    let mime = resolve_mime(&raw.bytes, raw.declared_mime.as_deref())?;
    let (width, height) = inspect_dimensions(&raw.bytes)?;
    validate_pixel_limits(limits, width, height)?;

    log::info!(
        "🖼️ 图片读取成功 - 来源: {} 类型: {} 尺寸: {}x{} 体积: {:.1} KB",
        source_hint,
        mime,
        width,
        height,
        raw.bytes.len() as f64 / 1024.0
    );

    resize::fit_for_upload(
        PreparedImage {
            bytes: raw.bytes,
            mime,
            width,
            height,
        },
        limits,
    )
}

fn load(source: ImageSource, limits: &ImageLimits) -> Result<RawImage, InputError> {
    let raw = match source {
        ImageSource::Bytes { bytes, mime } => RawImage {
            bytes,
            declared_mime: mime,
            source_hint: "bytes",
        },
        ImageSource::Base64(data) => load_from_base64(&data, limits)?,
        ImageSource::FilePath(path) => load_from_file(&path, limits)?,
    };

    if raw.bytes.is_empty() {
        return Err(InputError::Empty);
    }
    ensure_file_size(raw.bytes.len() as u64, limits)?;

    Ok(raw)
}

fn ensure_file_size(len: u64, limits: &ImageLimits) -> Result<(), InputError> {
    if len > limits.max_file_size {
        return Err(InputError::TooLarge(format!(
            "图片过大：{:.2} MB（限制：{:.2} MB）",
            len as f64 / 1024.0 / 1024.0,
            limits.max_file_size as f64 / 1024.0 / 1024.0
        )));
    }
    Ok(())
}

fn load_from_base64(data: &str, limits: &ImageLimits) -> Result<RawImage, InputError> {
    let (bytes, declared_mime) = parse_base64_with_limit(data, limits.max_file_size)?;
    Ok(RawImage {
        bytes: Bytes::from(bytes),
        declared_mime,
        source_hint: "base64",
    })
}

fn load_from_file(path: &Path, limits: &ImageLimits) -> Result<RawImage, InputError> {
    log::info!("📁 开始读取本地图片 - 路径: {}", path.display());

    if !path.exists() {
        return Err(InputError::FileSystem(format!("文件不存在：{}", path.display())));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|e| InputError::FileSystem(format!("无法读取文件信息：{}", e)))?;
    ensure_file_size(metadata.len(), limits)?;

    let bytes = std::fs::read(path)
        .map_err(|e| InputError::FileSystem(format!("无法读取图片文件：{}", e)))?;

    Ok(RawImage {
        bytes: Bytes::from(bytes),
        declared_mime: None,
        source_hint: "file",
    })
}

fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, InputError> {
    let len = base64_data.len() as u64;
    let groups = len
        .checked_add(3)
        .ok_or_else(|| InputError::TooLarge("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| InputError::TooLarge("Base64 解码体积估算溢出".to_string()))
}

/// 解析 Data URL 或纯 Base64，返回字节与 Data URL 中声明的 MIME。
fn parse_base64_with_limit(
    data: &str,
    max_file_size: u64,
) -> Result<(Vec<u8>, Option<String>), InputError> {
    let normalized = data.trim();

    let (payload, declared_mime) = match normalized.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| InputError::Unreadable("Data URL 缺少数据部分".to_string()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| InputError::Unreadable("缺少 base64 标记".to_string()))?;
            if !mime.to_ascii_lowercase().starts_with("image/") {
                return Err(InputError::UnsupportedMime(mime.to_string()));
            }
            (payload, Some(mime.to_string()))
        }
        None => (normalized, None),
    };

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(InputError::Empty);
    }

    let estimated_len = estimate_base64_decoded_upper_bound_len(&compact)?;
    if estimated_len > max_file_size {
        return Err(InputError::TooLarge(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| InputError::Decode(format!("Base64 解码失败：{}", e)))?;

    Ok((bytes, declared_mime))
}

/// 以文件签名为准确定图片类型。
fn resolve_mime(bytes: &[u8], declared: Option<&str>) -> Result<ImageMime, InputError> {
    match ImageMime::sniff(bytes) {
        Some(sniffed) => {
            if let Some(declared) = declared {
                if ImageMime::parse(declared) != Some(sniffed) {
                    log::warn!(
                        "⚠️ 声明类型与文件签名不一致，按签名处理 - 声明: {} 实际: {}",
                        declared,
                        sniffed
                    );
                }
            }
            Ok(sniffed)
        }
        None => match infer::get(bytes) {
            Some(kind) => Err(InputError::UnsupportedMime(kind.mime_type().to_string())),
            None => match declared {
                Some(declared) if ImageMime::parse(declared).is_none() => {
                    Err(InputError::UnsupportedMime(declared.to_string()))
                }
                _ => Err(InputError::Unreadable("无法识别的图片内容".to_string())),
            },
        },
    }
}

/// 仅通过图片头信息读取宽高。
fn inspect_dimensions(bytes: &[u8]) -> Result<(u32, u32), InputError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| InputError::Unreadable(format!("无法识别图片格式：{}", e)))?;

    reader
        .into_dimensions()
        .map_err(|e| InputError::Unreadable(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limits(limits: &ImageLimits, width: u32, height: u32) -> Result<(), InputError> {
    if width == 0 || height == 0 {
        return Err(InputError::Unreadable(format!("图片尺寸无效：{}x{}", width, height)));
    }

    let pixels = (width as u64)
        .checked_mul(height as u64)
        .ok_or_else(|| InputError::TooLarge("图片像素数溢出".to_string()))?;

    if pixels > limits.max_decoded_pixels {
        return Err(InputError::TooLarge(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, limits.max_decoded_pixels
        )));
    }

    Ok(())
}
