//! # 历史记录游标（history）
//!
//! ## 设计思路
//!
//! 在 `RecordStore::page` 之上维护“已加载记录序列 + 下一页游标 + 是否还有更多”，
//! 供列表界面做增量加载（无限滚动）与提交成功后的头部刷新。
//!
//! ## 实现思路
//!
//! - 状态放在 `std::sync::Mutex` 中，锁只在读写内存状态时短暂持有，绝不跨 `.await`。
//! - `loading` 标记保证同一时刻至多一个 `load_next` 在途，重复调用直接返回空结果。
//! - `generation` 在每次 `refresh_head` 时递增；在途的 `load_next` 完成时若发现代数变化，
//!   丢弃自己的结果，避免把旧游标下的页拼到新序列后面。
//! - `refresh_head` 之间用 async 锁串行化。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::record::AnalysisRecord;
use crate::store::{PaginationCursor, PersistenceError, RecordStore};

/// 历史列表配置。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// 每页记录数。
    pub page_size: usize,
    /// 单次分页查询超时时间（毫秒）。
    pub load_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            load_timeout_ms: 15_000,
        }
    }
}

/// 一次 `load_next` 的结果。
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    /// 本次追加到序列尾部的记录。
    pub appended: Vec<AnalysisRecord>,
    pub has_more: bool,
}

/// 历史状态快照（供界面渲染）。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub records: Vec<AnalysisRecord>,
    pub has_more: bool,
    pub is_loading: bool,
}

#[derive(Debug)]
struct HistoryState {
    records: Vec<AnalysisRecord>,
    cursor: Option<PaginationCursor>,
    has_more: bool,
    loading: bool,
    generation: u64,
}

/// 增量分页读取器。
pub struct HistoryCursor {
    store: Arc<dyn RecordStore>,
    config: HistoryConfig,
    state: Mutex<HistoryState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// 在途标记，离开作用域时自动清除（含出错与 future 被丢弃的情况）。
struct LoadingGuard<'a> {
    state: &'a Mutex<HistoryState>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        match self.state.lock() {
            Ok(mut state) => state.loading = false,
            Err(poisoned) => poisoned.into_inner().loading = false,
        }
    }
}

impl HistoryCursor {
    pub fn new(store: Arc<dyn RecordStore>, config: HistoryConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(HistoryState {
                records: Vec::new(),
                cursor: None,
                has_more: true,
                loading: false,
                generation: 0,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, HistoryState>, PersistenceError> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::Database("历史状态锁已中毒".to_string()))
    }

    async fn fetch_page(
        &self,
        cursor: Option<&PaginationCursor>,
    ) -> Result<crate::store::Page, PersistenceError> {
        let timeout_ms = self.config.load_timeout_ms;
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.store.page(cursor, self.config.page_size),
        )
        .await
        .map_err(|_| PersistenceError::Timeout(format!("分页查询超时（{}ms）", timeout_ms)))?
    }

    /// 读取下一页并追加到序列尾部。
    ///
    /// 已有加载在途或 `has_more == false` 时不访问存储，直接返回空结果。
    pub async fn load_next(&self) -> Result<LoadResult, PersistenceError> {
        let (cursor, generation) = {
            let mut state = self.lock_state()?;
            if state.loading || !state.has_more {
                log::debug!(
                    "📜 跳过加载 - loading: {} has_more: {}",
                    state.loading,
                    state.has_more
                );
                return Ok(LoadResult {
                    appended: Vec::new(),
                    has_more: state.has_more,
                });
            }
            state.loading = true;
            (state.cursor.clone(), state.generation)
        };
        let _loading = LoadingGuard { state: &self.state };

        let start = Instant::now();
        let page = self.fetch_page(cursor.as_ref()).await?;

        let mut state = self.lock_state()?;
        if state.generation != generation {
            log::info!("📜 加载期间列表已刷新，丢弃本页 {} 条结果", page.records.len());
            return Ok(LoadResult {
                appended: Vec::new(),
                has_more: state.has_more,
            });
        }

        state.records.extend(page.records.iter().cloned());
        if page.next_cursor.is_some() {
            state.cursor = page.next_cursor;
        }
        state.has_more = page.has_more;

        log::info!(
            "📜 历史加载完成 - 新增: {} 累计: {} has_more: {} 耗时: {}ms",
            page.records.len(),
            state.records.len(),
            state.has_more,
            start.elapsed().as_millis()
        );

        Ok(LoadResult {
            appended: page.records,
            has_more: state.has_more,
        })
    }

    /// 重新读取第一页。
    ///
    /// 旧的头部记录仍在新一页中时只把更新的记录插到前面，保留已加载的旧页与游标；
    /// 否则整体重置为新的一页。返回插入（或重置后）的记录。
    pub async fn refresh_head(&self) -> Result<Vec<AnalysisRecord>, PersistenceError> {
        let _serial = self.refresh_lock.lock().await;

        {
            let mut state = self.lock_state()?;
            state.generation = state.generation.wrapping_add(1);
        }

        let page = self.fetch_page(None).await?;

        let mut state = self.lock_state()?;
        state.generation = state.generation.wrapping_add(1);

        let head_position = state
            .records
            .first()
            .and_then(|head| page.records.iter().position(|record| record.id == head.id));

        match head_position {
            Some(position) => {
                let fresh: Vec<AnalysisRecord> = page.records[..position].to_vec();
                state.records.splice(0..0, fresh.iter().cloned());
                log::info!("🔄 头部刷新 - 插入 {} 条新记录", fresh.len());
                Ok(fresh)
            }
            None => {
                state.records = page.records.clone();
                state.cursor = page.next_cursor;
                state.has_more = page.has_more;
                log::info!(
                    "🔄 头部刷新 - 重置列表，共 {} 条 has_more: {}",
                    state.records.len(),
                    state.has_more
                );
                Ok(page.records)
            }
        }
    }

    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.lock_state().map(|state| state.records.clone()).unwrap_or_default()
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().map(|state| state.loading).unwrap_or(false)
    }

    pub fn has_more(&self) -> bool {
        self.lock_state().map(|state| state.has_more).unwrap_or(false)
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        match self.lock_state() {
            Ok(state) => HistorySnapshot {
                records: state.records.clone(),
                has_more: state.has_more,
                is_loading: state.loading,
            },
            Err(_) => HistorySnapshot {
                records: Vec::new(),
                has_more: false,
                is_loading: false,
            },
        }
    }

    /// 监听提交成功信号，每次收到后刷新头部。
    ///
    /// 发送端全部关闭后任务退出。
    pub fn watch_refresh(self: Arc<Self>, mut signal: watch::Receiver<u64>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let submission = *signal.borrow_and_update();
                if let Err(e) = self.refresh_head().await {
                    log::warn!("⚠️ 提交 #{} 后刷新历史失败：{}", submission, e);
                }
            }
            log::debug!("刷新信号已关闭，停止监听");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AnalysisFields;
    use crate::store::SqliteRecordStore;

    fn fields(breed: &str) -> AnalysisFields {
        AnalysisFields {
            animal_kind: "sheep".to_string(),
            breed: breed.to_string(),
            body_type: "stocky".to_string(),
            frame_type: "small".to_string(),
            estimated_weight: 70.0,
            weight_range: "60-80kg".to_string(),
        }
    }

    async fn seeded_store(breeds: &[&str]) -> Arc<SqliteRecordStore> {
        let store = Arc::new(SqliteRecordStore::open_in_memory().expect("open store"));
        for breed in breeds {
            store.append(&fields(breed)).await.expect("append");
        }
        store
    }

    fn breeds(records: &[AnalysisRecord]) -> Vec<String> {
        records.iter().map(|r| r.fields.breed.clone()).collect()
    }

    fn config(page_size: usize) -> HistoryConfig {
        HistoryConfig {
            page_size,
            ..HistoryConfig::default()
        }
    }

    #[tokio::test]
    async fn pages_accumulate_newest_first() {
        let store = seeded_store(&["a", "b", "c"]).await;
        let history = HistoryCursor::new(store, config(2));

        let first = history.load_next().await.expect("first load");
        assert_eq!(breeds(&first.appended), vec!["c", "b"]);
        assert!(first.has_more);

        let second = history.load_next().await.expect("second load");
        assert_eq!(breeds(&second.appended), vec!["a"]);
        assert!(!second.has_more);

        assert_eq!(breeds(&history.records()), vec!["c", "b", "a"]);
        assert!(!history.is_loading());
    }

    #[tokio::test]
    async fn refresh_prepends_only_new_records() {
        let store = seeded_store(&["a", "b", "c", "d"]).await;
        let history = HistoryCursor::new(store.clone(), config(2));
        history.load_next().await.expect("page 1");
        history.load_next().await.expect("page 2");

        store.append(&fields("e")).await.expect("append e");
        let inserted = history.refresh_head().await.expect("refresh");

        assert_eq!(breeds(&inserted), vec!["e"]);
        assert_eq!(breeds(&history.records()), vec!["e", "d", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn refresh_resets_when_old_head_is_out_of_first_page() {
        let store = seeded_store(&["a", "b"]).await;
        let history = HistoryCursor::new(store.clone(), config(2));
        history.load_next().await.expect("page 1");

        for breed in ["c", "d", "e"] {
            store.append(&fields(breed)).await.expect("append");
        }
        let fresh = history.refresh_head().await.expect("refresh");

        assert_eq!(breeds(&fresh), vec!["e", "d"]);
        assert_eq!(breeds(&history.records()), vec!["e", "d"]);
        assert!(history.has_more());

        let next = history.load_next().await.expect("continue after reset");
        assert_eq!(breeds(&next.appended), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn refresh_on_empty_history_loads_first_page() {
        let store = seeded_store(&[]).await;
        let history = HistoryCursor::new(store.clone(), config(10));

        let empty = history.load_next().await.expect("empty load");
        assert!(empty.appended.is_empty());
        assert!(!empty.has_more);

        store.append(&fields("a")).await.expect("append");
        history.refresh_head().await.expect("refresh");

        let snapshot = history.snapshot();
        assert_eq!(breeds(&snapshot.records), vec!["a"]);
        assert!(!snapshot.has_more);
        assert!(!snapshot.is_loading);
    }
}
