//! # Gemini 推理客户端
//!
//! ## 实现思路
//!
//! 1. 图片字节 Base64 编码后作为 `inline_data` 发送
//! 2. 通过 `generationConfig.responseSchema` 约束模型只输出六个字段的 JSON 对象
//! 3. 拼接候选结果中的文本片段，按 `AnalysisFields` 反序列化并做语义校验
//!
//! API Key 通过 `x-goog-api-key` 请求头传递，不出现在 URL 与日志中。

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{InferenceClient, InferenceError};
use crate::media::ImageMime;
use crate::record::{AnalysisFields, REQUIRED_FIELDS};

const CLASSIFY_PROMPT: &str = "Identify the animal type and breed. Also determine its body condition \
(e.g. lean/muscular/overweight), frame (small/medium/large), estimate the weight (kg), and give a \
typical weight range. Return the result in structured JSON format.";

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

/// Gemini 连接配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// API Key，只从配置文件或环境变量读取，不会被写回配置文件。
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout_secs: u64,
    /// 单次请求总超时时间（秒）。
    pub request_timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-flash-latest".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            connect_timeout_secs: 8,
            request_timeout_secs: 60,
        }
    }
}

/// 基于 Generative Language REST API 的分类客户端。
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, InferenceError> {
        if config.api_key.trim().is_empty() {
            return Err(InferenceError::Config("缺少 Gemini API Key".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(InferenceError::Config("模型名称不能为空".to_string()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| InferenceError::Config(format!("创建 HTTP 客户端失败：{}", e)))?;

        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model.trim()
        )
    }

    fn response_schema() -> serde_json::Value {
        json!({
            "type": "OBJECT",
            "description": "Animal classification and body condition analysis result",
            "properties": {
                "animal": { "type": "STRING" },
                "breed": { "type": "STRING" },
                "bodyType": { "type": "STRING" },
                "frameType": { "type": "STRING" },
                "estimatedWeight": { "type": "NUMBER" },
                "weightRange": { "type": "STRING" }
            },
            "required": REQUIRED_FIELDS,
        })
    }

    fn build_request_body(image: &[u8], mime: ImageMime) -> serde_json::Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": CLASSIFY_PROMPT },
                    {
                        "inline_data": {
                            "mime_type": mime.as_str(),
                            "data": general_purpose::STANDARD.encode(image),
                        }
                    }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": Self::response_schema(),
            }
        })
    }

    /// 解析 `generateContent` 响应体。
    fn parse_response(body: &[u8]) -> Result<AnalysisFields, InferenceError> {
        let response: GenerateContentResponse = serde_json::from_slice(body)
            .map_err(|e| InferenceError::MalformedResponse(format!("无法解析响应：{}", e)))?;

        let Some(candidate) = response.candidates.into_iter().next() else {
            let reason = response
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "无候选结果".to_string());
            return Err(InferenceError::MalformedResponse(format!("模型未返回结果：{}", reason)));
        };

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(InferenceError::MalformedResponse(format!(
                "候选结果不含文本（finishReason={}）",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        Self::parse_fields(&text)
    }

    fn parse_fields(text: &str) -> Result<AnalysisFields, InferenceError> {
        let payload = strip_code_fence(text);
        let fields: AnalysisFields = serde_json::from_str(payload).map_err(|e| {
            if e.is_data() {
                InferenceError::Schema(e.to_string())
            } else {
                InferenceError::MalformedResponse(format!("模型输出不是合法 JSON：{}", e))
            }
        })?;

        fields.validate()?;
        Ok(fields)
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(format!("请求超时（{}秒）", self.config.request_timeout_secs))
        } else if e.is_connect() {
            InferenceError::Transport(format!("无法连接：{}", e))
        } else {
            InferenceError::Transport(format!("请求失败：{}", e))
        }
    }

    fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
        let value = headers.get(reqwest::header::RETRY_AFTER)?;
        let text = value.to_str().ok()?.trim();
        let secs = text.parse::<u64>().ok()?;
        Some(secs.saturating_mul(1000))
    }

    fn error_message_from_body(body: &[u8]) -> String {
        #[derive(Deserialize)]
        struct ErrorEnvelope {
            error: ErrorDetail,
        }
        #[derive(Deserialize)]
        struct ErrorDetail {
            message: String,
        }

        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
            return envelope.error.message;
        }

        String::from_utf8_lossy(body)
            .chars()
            .take(ERROR_BODY_PREVIEW_CHARS)
            .collect()
    }
}

/// 去掉模型偶尔包裹在外层的 Markdown 代码块标记。
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn classify(&self, image: &[u8], mime: ImageMime) -> Result<AnalysisFields, InferenceError> {
        if image.is_empty() {
            return Err(InferenceError::Config("图片内容为空".to_string()));
        }

        let body = serde_json::to_vec(&Self::build_request_body(image, mime))
            .map_err(|e| InferenceError::Config(format!("序列化请求失败：{}", e)))?;

        log::debug!(
            "📡 发送分类请求 - model: {} mime: {} bytes: {}",
            self.config.model,
            mime,
            image.len()
        );

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", self.config.api_key.trim())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        let retry_after_ms = Self::retry_after_hint_ms(response.headers());
        let bytes = response.bytes().await.map_err(|e| self.map_reqwest_error(e))?;

        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                message: Self::error_message_from_body(&bytes),
                retry_after_ms,
            });
        }

        Self::parse_response(&bytes)
    }
}
