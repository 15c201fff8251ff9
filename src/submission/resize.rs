//! # 上传准备模块
//!
//! ## 设计思路
//!
//! 模型对输入图片有体积限制，且大图只会拖慢上传。超过单边尺寸或体积上限的图片
//! 在上传前降采样并重新编码为 JPEG；未超限的图片原样上传，不做任何解码。
//!
//! ## 实现思路
//!
//! 1. 判断是否超出 `upload_max_dimension` / `upload_max_bytes`
//! 2. 完整解码，按单边上限计算等比缩放尺寸
//! 3. 优先 `fast_image_resize`，失败时回退 `image::resize_exact`
//! 4. 以 `jpeg_quality` 重新编码

use std::io::Cursor;

use bytes::Bytes;
use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};

use super::config::ImageLimits;
use super::error::InputError;
use super::source::PreparedImage;
use crate::media::ImageMime;

/// 必要时缩小并重新编码图片。
pub(crate) fn fit_for_upload(image: PreparedImage, limits: &ImageLimits) -> Result<PreparedImage, InputError> {
    if !limits.adaptive_resize {
        return Ok(image);
    }

    let over_dimension =
        image.width > limits.upload_max_dimension || image.height > limits.upload_max_dimension;
    let over_bytes = image.bytes.len() as u64 > limits.upload_max_bytes;

    if !over_dimension && !over_bytes {
        return Ok(image);
    }

    let decoded = image::load_from_memory_with_format(&image.bytes, image.mime.image_format())
        .map_err(|e| InputError::Decode(format!("图片解码失败：{}", e)))?;

    let (width, height) = decoded.dimensions();
    let (target_width, target_height) = target_size(width, height, limits.upload_max_dimension);

    let resized = if (target_width, target_height) == (width, height) {
        decoded
    } else {
        log::info!(
            "🧩 上传前降采样：{}x{} -> {}x{}",
            width,
            height,
            target_width,
            target_height
        );
        match resize_with_fast_image_resize(&decoded, target_width, target_height) {
            Ok(resized) => resized,
            Err(err) => {
                log::warn!("⚠️ fast_image_resize 降采样失败，回退 image::resize_exact：{}", err);
                decoded.resize_exact(target_width, target_height, FilterType::Triangle)
            }
        }
    };

    let encoded = encode_jpeg(&resized, limits.jpeg_quality)?;
    if encoded.len() as u64 > limits.upload_max_bytes {
        log::warn!(
            "⚠️ 重新编码后仍超过上传体积上限：{:.1} KB（限制：{:.1} KB）",
            encoded.len() as f64 / 1024.0,
            limits.upload_max_bytes as f64 / 1024.0
        );
    }

    log::info!(
        "✅ 上传图片已重新编码 - {} {:.1} KB -> image/jpeg {:.1} KB",
        image.mime,
        image.bytes.len() as f64 / 1024.0,
        encoded.len() as f64 / 1024.0
    );

    Ok(PreparedImage {
        bytes: Bytes::from(encoded),
        mime: ImageMime::Jpeg,
        width: target_width,
        height: target_height,
    })
}

/// 按单边上限等比缩放后的尺寸（不放大）。
fn target_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    (
        ((width as f64 * scale).floor() as u32).max(1),
        ((height as f64 * scale).floor() as u32).max(1),
    )
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
) -> Result<DynamicImage, InputError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| InputError::Decode(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| InputError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| InputError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))?;

    Ok(DynamicImage::ImageRgba8(rgba))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, InputError> {
    let rgb = image.to_rgb8();
    let mut cursor = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| InputError::Decode(format!("JPEG 编码失败：{}", e)))?;
    Ok(cursor.into_inner())
}
