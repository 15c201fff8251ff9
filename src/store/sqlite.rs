//! # SQLite 记录存储
//!
//! ## 实现思路
//!
//! - 单连接 + `Mutex`，所有 SQL 在 `spawn_blocking` 中执行，避免阻塞 async 运行时。
//! - `created_at` 以微秒整数存储，由存储端时钟分配；写入时在事务内
//!   与当前最大值取较大者，保证同一存储内时间戳单调不减。
//! - `append_keyed` 在同一事务内先按 `write_key` 查找，已存在则原样返回，
//!   后台仍在执行的超时写入与随后的手动重试因此只落地一条。
//! - 分页条件为 `(created_at, id) < cursor`，与排序 `created_at DESC, id DESC` 一致。

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{Page, PaginationCursor, PersistenceError, RecordStore, ensure_page_size, schema};
use crate::record::{AnalysisFields, AnalysisRecord};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// 基于 rusqlite 的记录存储。
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl SqliteRecordStore {
    /// 打开（必要时创建）数据库文件并初始化 schema。
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::Database(format!("创建数据库目录失败: {}", e))
                })?;
            }
        }
        log::info!("数据库路径: {}", path.display());

        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::Database(format!("打开数据库失败: {}", e)))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::Database(format!("打开内存数据库失败: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(Utc::now),
        })
    }

    /// 替换存储端时钟（测试用）。
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| {
                PersistenceError::Database(format!("获取数据库锁失败: {}", e))
            })?;
            op(&guard)
        })
        .await
        .map_err(|e| PersistenceError::Database(format!("数据库任务异常退出: {}", e)))?
    }
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| PersistenceError::Malformed(format!("时间戳越界: {}", micros)))
}

fn find_by_write_key(
    conn: &Connection,
    write_key: &str,
) -> Result<Option<AnalysisRecord>, PersistenceError> {
    let row = conn
        .query_row(
            "SELECT id, animal, breed, body_type, frame_type, estimated_weight, weight_range, created_at
             FROM analysis_records
             WHERE write_key = ?1",
            params![write_key],
            read_row,
        )
        .optional()
        .map_err(|e| PersistenceError::Database(format!("按写入键查询失败: {}", e)))?;

    row.map(into_record).transpose()
}

fn append_record(
    conn: &Connection,
    write_key: Option<&str>,
    fields: &AnalysisFields,
    now: DateTime<Utc>,
) -> Result<AnalysisRecord, PersistenceError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| PersistenceError::Database(format!("开始事务失败: {}", e)))?;

    if let Some(key) = write_key {
        if let Some(existing) = find_by_write_key(&tx, key)? {
            log::info!("💾 写入键 {} 已存在记录 {}，不重复写入", key, existing.id);
            return Ok(existing);
        }
    }

    let latest: Option<i64> = tx
        .query_row("SELECT MAX(created_at) FROM analysis_records", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()
        .map_err(|e| PersistenceError::Database(format!("查询最新时间戳失败: {}", e)))?
        .flatten();

    let now_micros = now.timestamp_micros();
    let created_at = latest.map_or(now_micros, |latest| latest.max(now_micros));

    tx.execute(
        "INSERT INTO analysis_records
            (animal, breed, body_type, frame_type, estimated_weight, weight_range, created_at, write_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            fields.animal_kind,
            fields.breed,
            fields.body_type,
            fields.frame_type,
            fields.estimated_weight,
            fields.weight_range,
            created_at,
            write_key
        ],
    )
    .map_err(|e| PersistenceError::Database(format!("插入记录失败: {}", e)))?;
    let id = tx.last_insert_rowid();

    tx.commit()
        .map_err(|e| PersistenceError::Database(format!("提交事务失败: {}", e)))?;

    Ok(AnalysisRecord {
        id: id.to_string(),
        fields: fields.clone(),
        created_at: micros_to_datetime(created_at)?,
    })
}

fn query_page(
    conn: &Connection,
    cursor: Option<(i64, i64)>,
    page_size: usize,
) -> Result<Vec<AnalysisRecord>, PersistenceError> {
    let (cursor_created_at, cursor_id) = match cursor {
        Some((created_at, id)) => (Some(created_at), Some(id)),
        None => (None, None),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, animal, breed, body_type, frame_type, estimated_weight, weight_range, created_at
             FROM analysis_records
             WHERE ?1 IS NULL
                OR created_at < ?1
                OR (created_at = ?1 AND id < ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )
        .map_err(|e| PersistenceError::Database(format!("准备分页查询失败: {}", e)))?;

    let rows = stmt
        .query_map(params![cursor_created_at, cursor_id, page_size as i64], read_row)
        .map_err(|e| PersistenceError::Database(format!("查询记录失败: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PersistenceError::Database(format!("读取行失败: {}", e)))?;

    rows.into_iter().map(into_record).collect()
}

type RecordRow = (i64, AnalysisFields, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get::<_, i64>(0)?,
        AnalysisFields {
            animal_kind: row.get(1)?,
            breed: row.get(2)?,
            body_type: row.get(3)?,
            frame_type: row.get(4)?,
            estimated_weight: row.get(5)?,
            weight_range: row.get(6)?,
        },
        row.get::<_, i64>(7)?,
    ))
}

fn into_record((id, fields, created_at): RecordRow) -> Result<AnalysisRecord, PersistenceError> {
    Ok(AnalysisRecord {
        id: id.to_string(),
        fields,
        created_at: micros_to_datetime(created_at)?,
    })
}

fn decode_cursor(cursor: &PaginationCursor) -> Result<(i64, i64), PersistenceError> {
    let id = cursor
        .id()
        .parse::<i64>()
        .map_err(|_| PersistenceError::InvalidCursor(format!("非本存储生成的记录 id: {}", cursor.id())))?;
    Ok((cursor.created_at().timestamp_micros(), id))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn append(&self, fields: &AnalysisFields) -> Result<AnalysisRecord, PersistenceError> {
        let fields = fields.clone();
        let now = (self.clock)();
        self.with_conn(move |conn| append_record(conn, None, &fields, now)).await
    }

    async fn append_keyed(
        &self,
        write_key: &str,
        fields: &AnalysisFields,
    ) -> Result<AnalysisRecord, PersistenceError> {
        let fields = fields.clone();
        let write_key = write_key.to_string();
        let now = (self.clock)();
        self.with_conn(move |conn| append_record(conn, Some(&write_key), &fields, now))
            .await
    }

    async fn page(
        &self,
        cursor: Option<&PaginationCursor>,
        page_size: usize,
    ) -> Result<Page, PersistenceError> {
        ensure_page_size(page_size)?;
        let cursor = cursor.map(decode_cursor).transpose()?;

        let records = self
            .with_conn(move |conn| query_page(conn, cursor, page_size))
            .await?;
        Ok(Page::from_records(records, page_size))
    }
}
