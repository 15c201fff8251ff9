//! # Cloud Firestore 记录存储
//!
//! ## 实现思路
//!
//! - `append`：客户端生成文档 id，通过 `documents:commit` 写入；
//!   `currentDocument.exists=false` 防止覆盖，`createdAt` 使用
//!   `REQUEST_TIME` 服务端变换，写入结果中的 `transformResults` 即为服务端时间。
//! - `append_keyed`：写入键直接作为文档 id；提交返回 409（`ALREADY_EXISTS`）说明
//!   上一次写入已经落地，改为读取该文档返回。
//! - `page`：`documents:runQuery`，按 `createdAt DESC, __name__ DESC` 排序，
//!   游标以 `startAt { before: false }` 表达“从上一页最后一条之后开始”。
//!
//! 只使用 REST + JSON，不依赖 gRPC SDK。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Page, PaginationCursor, PersistenceError, RecordStore, ensure_page_size, new_write_key};
use crate::record::{AnalysisFields, AnalysisRecord};

const CREATED_AT_FIELD: &str = "createdAt";

/// Firestore 连接配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub collection: String,
    pub base_url: String,
    /// Web API Key（受安全规则约束的客户端访问方式）。
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// OAuth2 访问令牌（服务端访问方式），优先于 `api_key`。
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            database: "(default)".to_string(),
            collection: "animals".to_string(),
            base_url: "https://firestore.googleapis.com/v1".to_string(),
            api_key: None,
            bearer_token: None,
            connect_timeout_secs: 8,
            request_timeout_secs: 15,
        }
    }
}

/// 基于 Firestore REST API 的记录存储。
pub struct FirestoreRecordStore {
    http: reqwest::Client,
    config: FirestoreConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitResponse {
    #[serde(default)]
    write_results: Vec<WriteResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResult {
    #[serde(default)]
    transform_results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl FirestoreRecordStore {
    pub fn new(config: FirestoreConfig) -> Result<Self, PersistenceError> {
        if config.project_id.trim().is_empty() {
            return Err(PersistenceError::InvalidArgument("缺少 Firestore project_id".to_string()));
        }
        if config.collection.trim().is_empty() || config.collection.contains('/') {
            return Err(PersistenceError::InvalidArgument(format!(
                "集合名称无效：{}",
                config.collection
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| PersistenceError::Transport(format!("创建 HTTP 客户端失败：{}", e)))?;

        Ok(Self { http, config })
    }

    /// `projects/{p}/databases/{d}/documents`
    fn documents_path(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.config.project_id.trim(),
            self.config.database.trim()
        )
    }

    fn document_name(&self, id: &str) -> String {
        format!("{}/{}/{}", self.documents_path(), self.config.collection, id)
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.documents_path(),
            suffix
        )
    }

    fn encode_fields(fields: &AnalysisFields) -> Value {
        json!({
            "animal": { "stringValue": fields.animal_kind },
            "breed": { "stringValue": fields.breed },
            "bodyType": { "stringValue": fields.body_type },
            "frameType": { "stringValue": fields.frame_type },
            "estimatedWeight": { "doubleValue": fields.estimated_weight },
            "weightRange": { "stringValue": fields.weight_range },
        })
    }

    fn build_commit_body(&self, id: &str, fields: &AnalysisFields) -> Value {
        json!({
            "writes": [{
                "update": {
                    "name": self.document_name(id),
                    "fields": Self::encode_fields(fields),
                },
                "updateTransforms": [{
                    "fieldPath": CREATED_AT_FIELD,
                    "setToServerValue": "REQUEST_TIME",
                }],
                "currentDocument": { "exists": false },
            }]
        })
    }

    fn build_query_body(&self, cursor: Option<&PaginationCursor>, page_size: usize) -> Value {
        let mut query = json!({
            "from": [{ "collectionId": self.config.collection }],
            "orderBy": [
                { "field": { "fieldPath": CREATED_AT_FIELD }, "direction": "DESCENDING" },
                { "field": { "fieldPath": "__name__" }, "direction": "DESCENDING" },
            ],
            "limit": page_size,
        });

        if let Some(cursor) = cursor {
            query["startAt"] = json!({
                "values": [
                    { "timestampValue": format_timestamp(cursor.created_at()) },
                    { "referenceValue": self.document_name(cursor.id()) },
                ],
                "before": false,
            });
        }

        json!({ "structuredQuery": query })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = self.config.bearer_token.as_deref().filter(|t| !t.trim().is_empty()) {
            return request.bearer_auth(token.trim());
        }
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return request.header("x-goog-api-key", key.trim());
        }
        request
    }

    async fn post_json(&self, url: String, body: &Value) -> Result<Vec<u8>, PersistenceError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| PersistenceError::InvalidArgument(format!("序列化请求失败：{}", e)))?;

        let request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, PersistenceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.map_reqwest_error(e))?;

        if !status.is_success() {
            return Err(PersistenceError::Status {
                status: status.as_u16(),
                message: error_message_from_body(&bytes),
            });
        }

        Ok(bytes.to_vec())
    }

    /// 读取单个文档（`GET {base}/{document_name}`）。
    async fn get_document(&self, id: &str) -> Result<AnalysisRecord, PersistenceError> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.document_name(id)
        );
        let body = self.send(self.http.get(url)).await?;
        let document: Document = serde_json::from_slice(&body)
            .map_err(|e| PersistenceError::Malformed(format!("无法解析文档：{}", e)))?;
        decode_document(document)
    }

    async fn commit_new_document(
        &self,
        id: String,
        fields: &AnalysisFields,
    ) -> Result<AnalysisRecord, PersistenceError> {
        let body = self.build_commit_body(&id, fields);

        let response = self.post_json(self.url(":commit"), &body).await?;
        let created_at = Self::parse_commit_timestamp(&response)?;

        log::debug!("💾 Firestore 写入成功 - collection: {} id: {}", self.config.collection, id);

        Ok(AnalysisRecord {
            id,
            fields: fields.clone(),
            created_at,
        })
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> PersistenceError {
        if e.is_timeout() {
            PersistenceError::Timeout(format!("请求超时（{}秒）", self.config.request_timeout_secs))
        } else if e.is_connect() {
            PersistenceError::Transport(format!("无法连接：{}", e))
        } else {
            PersistenceError::Transport(format!("请求失败：{}", e))
        }
    }

    fn parse_commit_timestamp(body: &[u8]) -> Result<DateTime<Utc>, PersistenceError> {
        let response: CommitResponse = serde_json::from_slice(body)
            .map_err(|e| PersistenceError::Malformed(format!("无法解析写入响应：{}", e)))?;

        let value = response
            .write_results
            .first()
            .and_then(|result| result.transform_results.first())
            .ok_or_else(|| PersistenceError::Malformed("写入响应缺少服务端时间".to_string()))?;

        decode_timestamp(value)
    }

    fn parse_query_records(body: &[u8]) -> Result<Vec<AnalysisRecord>, PersistenceError> {
        let items: Vec<RunQueryItem> = serde_json::from_slice(body)
            .map_err(|e| PersistenceError::Malformed(format!("无法解析查询响应：{}", e)))?;

        items
            .into_iter()
            .filter_map(|item| item.document)
            .map(decode_document)
            .collect()
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(value: &Value) -> Result<DateTime<Utc>, PersistenceError> {
    let text = value
        .get("timestampValue")
        .and_then(Value::as_str)
        .ok_or_else(|| PersistenceError::Malformed(format!("不是时间戳值：{}", value)))?;

    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Malformed(format!("时间戳格式错误 {}：{}", text, e)))
}

fn decode_string(fields: &Map<String, Value>, name: &str) -> Result<String, PersistenceError> {
    fields
        .get(name)
        .and_then(|value| value.get("stringValue"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PersistenceError::Malformed(format!("文档缺少文本字段 {}", name)))
}

fn decode_number(fields: &Map<String, Value>, name: &str) -> Result<f64, PersistenceError> {
    let value = fields
        .get(name)
        .ok_or_else(|| PersistenceError::Malformed(format!("文档缺少数值字段 {}", name)))?;

    if let Some(number) = value.get("doubleValue").and_then(Value::as_f64) {
        return Ok(number);
    }
    // integerValue 在 REST 中以字符串编码
    value
        .get("integerValue")
        .and_then(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()).or_else(|| v.as_i64()))
        .map(|n| n as f64)
        .ok_or_else(|| PersistenceError::Malformed(format!("字段 {} 不是数值", name)))
}

fn decode_document(document: Document) -> Result<AnalysisRecord, PersistenceError> {
    let id = document
        .name
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PersistenceError::Malformed(format!("文档名无效：{}", document.name)))?
        .to_string();

    let fields = &document.fields;
    let created_at = fields
        .get(CREATED_AT_FIELD)
        .ok_or_else(|| PersistenceError::Malformed(format!("文档 {} 缺少 createdAt", id)))
        .and_then(decode_timestamp)?;

    Ok(AnalysisRecord {
        fields: AnalysisFields {
            animal_kind: decode_string(fields, "animal")?,
            breed: decode_string(fields, "breed")?,
            body_type: decode_string(fields, "bodyType")?,
            frame_type: decode_string(fields, "frameType")?,
            estimated_weight: decode_number(fields, "estimatedWeight")?,
            weight_range: decode_string(fields, "weightRange")?,
        },
        id,
        created_at,
    })
}

fn error_message_from_body(body: &[u8]) -> String {
    let parsed: Option<String> = serde_json::from_slice::<Value>(body).ok().and_then(|value| {
        // runQuery 出错时返回数组包裹的错误对象
        let error = value.get("error").or_else(|| value.get(0).and_then(|v| v.get("error")))?;
        error.get("message").and_then(Value::as_str).map(str::to_string)
    });

    parsed.unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(300).collect())
}

#[async_trait]
impl RecordStore for FirestoreRecordStore {
    async fn append(&self, fields: &AnalysisFields) -> Result<AnalysisRecord, PersistenceError> {
        self.commit_new_document(new_write_key(), fields).await
    }

    async fn append_keyed(
        &self,
        write_key: &str,
        fields: &AnalysisFields,
    ) -> Result<AnalysisRecord, PersistenceError> {
        if write_key.is_empty() || write_key.contains('/') || write_key.starts_with("__") {
            return Err(PersistenceError::InvalidArgument(format!("写入键不能作为文档 id：{}", write_key)));
        }

        match self.commit_new_document(write_key.to_string(), fields).await {
            Err(PersistenceError::Status { status: 409, .. }) => {
                log::info!("💾 文档 {} 已存在，读取已落地的记录", write_key);
                self.get_document(write_key).await
            }
            other => other,
        }
    }

    async fn page(
        &self,
        cursor: Option<&PaginationCursor>,
        page_size: usize,
    ) -> Result<Page, PersistenceError> {
        ensure_page_size(page_size)?;

        let body = self.build_query_body(cursor, page_size);
        let response = self.post_json(self.url(":runQuery"), &body).await?;
        let records = Self::parse_query_records(&response)?;

        Ok(Page::from_records(records, page_size))
    }
}
