//! # 记录存储模块（store）
//!
//! ## 设计思路
//!
//! 文档数据库对外只暴露两个能力：
//! - `append`：插入一条新记录，`id` 与 `created_at` 由存储端分配
//!   （`append_keyed` 为带写入键的去重版本）
//! - `page`：按 `created_at DESC, id DESC` 的全序做游标分页
//!
//! 远端 SDK 的 query builder（orderBy / startAfter / limit）被收敛为
//! 不透明的 `PaginationCursor` + `page(cursor, size)`，调用方无需了解底层查询细节。
//!
//! ## 实现
//!
//! - `FirestoreRecordStore`：Cloud Firestore REST（生产）
//! - `SqliteRecordStore`：本地 SQLite 文档表（开发 / 单机部署 / 测试）

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{AnalysisFields, AnalysisRecord};

mod firestore;
mod schema;
mod sqlite;

pub use firestore::{FirestoreConfig, FirestoreRecordStore};
pub use sqlite::SqliteRecordStore;

/// 存储层错误。
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("网络错误：{0}")]
    Transport(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("存储服务返回 HTTP {status}：{message}")]
    Status { status: u16, message: String },

    #[error("数据库错误：{0}")]
    Database(String),

    #[error("存储响应格式错误：{0}")]
    Malformed(String),

    #[error("分页游标无效：{0}")]
    InvalidCursor(String),

    #[error("参数错误：{0}")]
    InvalidArgument(String),
}

impl PersistenceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "E_STORE_NETWORK",
            Self::Timeout(_) => "E_STORE_TIMEOUT",
            Self::Status { .. } => "E_STORE_STATUS",
            Self::Database(_) => "E_STORE_DATABASE",
            Self::Malformed(_) => "E_STORE_MALFORMED",
            Self::InvalidCursor(_) => "E_STORE_CURSOR",
            Self::InvalidArgument(_) => "E_STORE_ARGUMENT",
        }
    }
}

/// 分页位置：上一页最后一条记录之后。
///
/// 对调用方不透明，只能由已读取的记录构造。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    created_at: DateTime<Utc>,
    id: String,
}

impl PaginationCursor {
    /// 指向 `record` 之后的位置。
    pub fn after(record: &AnalysisRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id.clone(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// 一页查询结果。
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<AnalysisRecord>,
    /// 空页时为 `None`。
    pub next_cursor: Option<PaginationCursor>,
    /// 启发式：本页恰好取满 `page_size` 条即认为可能还有更多。
    pub has_more: bool,
}

impl Page {
    pub fn from_records(records: Vec<AnalysisRecord>, page_size: usize) -> Self {
        let next_cursor = records.last().map(PaginationCursor::after);
        let has_more = page_size > 0 && records.len() == page_size;
        Self {
            records,
            next_cursor,
            has_more,
        }
    }
}

/// 生成一次提交的写入键。
pub(crate) fn new_write_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn ensure_page_size(page_size: usize) -> Result<(), PersistenceError> {
    if page_size == 0 {
        return Err(PersistenceError::InvalidArgument("page_size 必须大于 0".to_string()));
    }
    Ok(())
}

/// 分析记录存储能力。
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 持久化一条新记录，由存储端分配 `id` 与 `created_at`。
    async fn append(&self, fields: &AnalysisFields) -> Result<AnalysisRecord, PersistenceError>;

    /// 带写入键的 `append`：同一 `write_key` 至多落地一条记录，
    /// 重复写入返回已存在的那条。
    ///
    /// 超时后无法确认上一次写入是否已到达存储端，手动重试必须复用同一个键。
    /// 默认实现不去重，直接转发到 `append`。
    async fn append_keyed(
        &self,
        write_key: &str,
        fields: &AnalysisFields,
    ) -> Result<AnalysisRecord, PersistenceError> {
        log::debug!("存储端不支持写入键，忽略 {}", write_key);
        self.append(fields).await
    }

    /// 读取 `cursor` 之后（`None` 表示从头）的至多 `page_size` 条记录。
    async fn page(
        &self,
        cursor: Option<&PaginationCursor>,
        page_size: usize,
    ) -> Result<Page, PersistenceError>;
}

/// 存储后端选择。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Firestore(FirestoreConfig),
    Sqlite { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Firestore(FirestoreConfig::default())
    }
}
