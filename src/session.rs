//! # 会话装配
//!
//! ## 设计思路
//!
//! 应用入口只需要一个 `Session`：它按配置创建推理客户端、存储后端、流水线与历史游标。
//! 构造是纯同步装配；“提交成功 → 刷新历史头部”的监听任务在 `start` 中启动。组件之间只通过 trait 对象与
//! `watch` 信号连接，没有全局单例。

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::history::{HistoryConfig, HistoryCursor, LoadResult};
use crate::inference::{GeminiClient, InferenceClient};
use crate::store::{FirestoreRecordStore, RecordStore, SqliteRecordStore, StoreConfig};
use crate::submission::{LogSink, NotificationSink, PipelineConfig, SubmissionPipeline};

pub struct Session {
    pipeline: Arc<SubmissionPipeline>,
    history: Arc<HistoryCursor>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// 按配置打开存储后端。
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, AppError> {
    let store: Arc<dyn RecordStore> = match config {
        StoreConfig::Firestore(firestore) => {
            log::info!(
                "使用 Firestore 存储 - project: {} collection: {}",
                firestore.project_id,
                firestore.collection
            );
            Arc::new(FirestoreRecordStore::new(firestore.clone())?)
        }
        StoreConfig::Sqlite { path } => Arc::new(SqliteRecordStore::open(path)?),
    };
    Ok(store)
}

impl Session {
    /// 校验配置并装配全部组件。
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        config.validate()?;

        let inference: Arc<dyn InferenceClient> = Arc::new(GeminiClient::new(config.gemini.clone())?);
        let store = open_store(&config.store)?;
        log::info!("推理模型: {}", config.gemini.model);

        Ok(Self::with_components(
            inference,
            store,
            Arc::new(LogSink),
            config.pipeline.clone(),
            config.history.clone(),
        ))
    }

    /// 使用外部提供的组件装配会话。
    pub fn with_components(
        inference: Arc<dyn InferenceClient>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        pipeline_config: PipelineConfig,
        history_config: HistoryConfig,
    ) -> Self {
        let pipeline = Arc::new(SubmissionPipeline::new(
            inference,
            Arc::clone(&store),
            sink,
            pipeline_config,
        ));
        let history = Arc::new(HistoryCursor::new(store, history_config));

        Self {
            pipeline,
            history,
            refresh_task: Mutex::new(None),
        }
    }

    /// 启动刷新监听并加载历史第一页。
    ///
    /// 重复调用不会启动第二个监听任务。
    pub async fn start(&self) -> Result<LoadResult, AppError> {
        {
            let mut task = self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.is_none() {
                let receiver = self.pipeline.subscribe_refresh();
                *task = Some(Arc::clone(&self.history).watch_refresh(receiver));
            }
        }

        let first = self.history.load_next().await?;
        log::info!(
            "🚀 会话已启动 - 历史首屏 {} 条 has_more: {}",
            first.appended.len(),
            first.has_more
        );
        Ok(first)
    }

    pub fn pipeline(&self) -> &Arc<SubmissionPipeline> {
        &self.pipeline
    }

    pub fn history(&self) -> &Arc<HistoryCursor> {
        &self.history
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let task = self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
