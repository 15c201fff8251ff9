//! # 配置模块
//!
//! ## 设计思路
//!
//! 将流水线所有“可调策略”集中到 `PipelineConfig`：推理重试与退避、
//! 远端调用超时、输入图片的体积与像素上限、上传前的降采样策略。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的配置（2 次重试，退避从 1 秒起）。
//! - `validate` 在启动时做一次范围检查，运行期不再重复校验。

use serde::{Deserialize, Serialize};

/// 输入图片限制与上传准备策略。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLimits {
    /// 原始字节允许的最大体积（字节）。
    pub max_file_size: u64,
    /// 图片头中读取的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 是否在上传前做自适应降采样。
    pub adaptive_resize: bool,
    /// 上传给模型的图片宽/高单边最大值。
    pub upload_max_dimension: u32,
    /// 上传体积上限（字节），超出时重新编码为 JPEG。
    pub upload_max_bytes: u64,
    /// 重新编码 JPEG 的质量（1~100）。
    pub jpeg_quality: u8,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            adaptive_resize: true,
            upload_max_dimension: 2048,
            upload_max_bytes: 4 * 1024 * 1024,
            jpeg_quality: 85,
        }
    }
}

/// 提交流水线配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 推理瞬时失败的最大重试次数（不含首次请求）。
    pub inference_retries: u32,
    /// 首次重试前的基础等待时间（毫秒），之后按 2 倍递增。
    pub retry_base_delay_ms: u64,
    /// 单次退避等待上限（毫秒）。
    pub retry_max_delay_ms: u64,
    /// 单次推理请求超时（毫秒）。
    pub inference_timeout_ms: u64,
    /// 单次写入超时（毫秒）。
    pub persist_timeout_ms: u64,
    pub image: ImageLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_retries: 2,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 8_000,
            inference_timeout_ms: 60_000,
            persist_timeout_ms: 15_000,
            image: ImageLimits::default(),
        }
    }
}

const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
pub(crate) const MAX_INFERENCE_RETRIES: u32 = 5;

impl PipelineConfig {
    /// 校验取值范围，返回第一条不满足的说明。
    pub fn validate(&self) -> Result<(), String> {
        if self.inference_retries > MAX_INFERENCE_RETRIES {
            return Err(format!("inference_retries 不能大于 {}", MAX_INFERENCE_RETRIES));
        }
        if self.retry_base_delay_ms == 0 {
            return Err("retry_base_delay_ms 必须大于 0".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms 不能小于 retry_base_delay_ms".to_string());
        }
        for (name, value) in [
            ("inference_timeout_ms", self.inference_timeout_ms),
            ("persist_timeout_ms", self.persist_timeout_ms),
        ] {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&value) {
                return Err(format!(
                    "{} 必须在 {}~{} 毫秒之间",
                    name, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
                ));
            }
        }
        if self.image.max_file_size == 0 {
            return Err("image.max_file_size 必须大于 0".to_string());
        }
        if self.image.upload_max_dimension < 64 {
            return Err("image.upload_max_dimension 不能小于 64".to_string());
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            return Err("image.jpeg_quality 必须在 1~100 之间".to_string());
        }
        Ok(())
    }
}
