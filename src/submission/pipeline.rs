//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `SubmissionPipeline` 只负责流程编排，推理与存储通过 trait 对象在构造时注入。
//! 处理链路固定为：
//! 1. `Reading`：读取并校验图片（阻塞线程池）
//! 2. `Inferring`：调用模型，瞬时失败按指数退避重试
//! 3. `Persisting`：带写入键写入一次，失败不自动重试，结果连同写入键留待 `retry_persist`
//! 4. 发出终态事件，成功时通知历史列表刷新
//!
//! ## 实现思路
//!
//! - 状态放在 `Arc<PipelineInner>` 中；每次提交在 `tokio::spawn` 出的任务里执行，
//!   调用方只等待 `JoinHandle`。调用方丢弃 future 不会取消在途的推理或写入，
//!   终态事件、待重试结果与刷新信号照常产生。
//! - 状态机放在 `std::sync::Mutex` 中，只在迁移时短暂加锁，锁不跨 `.await`。
//! - 非 `Idle` 时的调用立即返回 `Busy`，不排队。
//! - `ActiveSubmission` 归后台任务所有，任务结束（含 panic）时把状态复位为 `Idle`。
//! - 每个远端调用都包在 `tokio::time::timeout` 中。
//! - 记录 `read/infer/persist/total` 阶段耗时，便于性能诊断。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::PipelineConfig;
use super::error::{InputError, SubmitError};
use super::loader;
use super::notify::{NotificationSink, PipelineState, SubmissionEvent};
use super::source::{ImageSource, PreparedImage};
use crate::backoff::retry_delay;
use crate::inference::{InferenceClient, InferenceError};
use crate::record::{AnalysisFields, AnalysisRecord};
use crate::store::{PersistenceError, RecordStore, new_write_key};

/// 图片提交流水线。
pub struct SubmissionPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    inference: Arc<dyn InferenceClient>,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    config: PipelineConfig,
    state: Mutex<PipelineState>,
    /// 推理成功但写入失败的结果。
    pending: Mutex<Option<PendingWrite>>,
    refresh_tx: watch::Sender<u64>,
    submissions: AtomicU64,
}

/// 待重新写入的结果；`write_key` 在整个提交内保持不变。
struct PendingWrite {
    write_key: String,
    fields: AnalysisFields,
}

/// 进行中的提交；drop 时状态回到 `Idle`。
struct ActiveSubmission {
    pipeline: Arc<PipelineInner>,
    id: u64,
}

impl Drop for ActiveSubmission {
    fn drop(&mut self) {
        log::debug!("提交 #{} 结束，流水线回到 Idle", self.id);
        self.pipeline.transition(PipelineState::Idle);
    }
}

#[derive(Default)]
struct StageTimings {
    read: Duration,
    infer: Duration,
    persist: Duration,
}

impl SubmissionPipeline {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        config: PipelineConfig,
    ) -> Self {
        let (refresh_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(PipelineInner {
                inference,
                store,
                sink,
                config,
                state: Mutex::new(PipelineState::Idle),
                pending: Mutex::new(None),
                refresh_tx,
                submissions: AtomicU64::new(0),
            }),
        }
    }

    /// 当前状态快照。
    pub fn state(&self) -> PipelineState {
        self.inner.lock_state().clone()
    }

    /// 等待重新保存的分析结果（上一次写入失败时存在）。
    pub fn pending_result(&self) -> Option<AnalysisFields> {
        self.inner.lock_pending().as_ref().map(|pending| pending.fields.clone())
    }

    /// 订阅“提交成功”信号，值为成功提交的累计次数。
    pub fn subscribe_refresh(&self) -> watch::Receiver<u64> {
        self.inner.refresh_tx.subscribe()
    }

    /// 提交内存中的图片字节。
    pub async fn submit_bytes(
        &self,
        bytes: impl Into<Bytes>,
        mime: Option<&str>,
    ) -> Result<AnalysisRecord, SubmitError> {
        self.submit(ImageSource::Bytes {
            bytes: bytes.into(),
            mime: mime.map(str::to_string),
        })
        .await
    }

    /// 处理主入口：读取 → 推理 → 写入 → 通知。
    ///
    /// 处理在后台任务中进行；丢弃返回的 future 只是不再等待结果，
    /// 本次提交仍会走到终态并发出事件。
    ///
    /// # 示例
    /// ```rust,ignore
    /// use animal_scan::submission::ImageSource;
    ///
    /// let record = pipeline
    ///     .submit(ImageSource::FilePath("/tmp/beagle.jpg".into()))
    ///     .await?;
    /// println!("{} {}", record.fields.breed, record.id);
    /// ```
    pub async fn submit(&self, source: ImageSource) -> Result<AnalysisRecord, SubmitError> {
        let active = PipelineInner::begin(&self.inner, PipelineState::Reading)?;

        if let Some(discarded) = self.inner.lock_pending().take() {
            log::warn!(
                "⚠️ 新提交开始，丢弃未保存的分析结果：{} / {}",
                discarded.fields.animal_kind,
                discarded.fields.breed
            );
        }

        let handle = tokio::spawn(async move {
            let pipeline = Arc::clone(&active.pipeline);
            let total_start = Instant::now();
            let mut timings = StageTimings::default();
            let result = pipeline.run_submission(source, &mut timings).await;

            pipeline.finish(active.id, result, &timings, total_start)
        });

        Self::join(handle).await
    }

    /// 重新写入上一次写入失败的结果，不重新读取图片、不重新推理。
    ///
    /// 沿用首次写入的写入键，上一次超时但实际已落地的写入不会产生第二条记录。
    pub async fn retry_persist(&self) -> Result<AnalysisRecord, SubmitError> {
        if self.inner.lock_pending().is_none() {
            return Err(SubmitError::NothingToRetry);
        }

        let active = PipelineInner::begin(&self.inner, PipelineState::Persisting)?;
        let pending = self.inner.lock_pending().take().ok_or(SubmitError::NothingToRetry)?;

        log::info!("🔁 提交 #{} 重新保存分析结果 - 写入键: {}", active.id, pending.write_key);

        let handle = tokio::spawn(async move {
            let pipeline = Arc::clone(&active.pipeline);
            let total_start = Instant::now();
            let mut timings = StageTimings::default();
            let result = pipeline.persist_stage(pending, &mut timings).await;

            pipeline.finish(active.id, result, &timings, total_start)
        });

        Self::join(handle).await
    }

    async fn join(
        handle: JoinHandle<Result<AnalysisRecord, SubmitError>>,
    ) -> Result<AnalysisRecord, SubmitError> {
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                log::error!("❌ 提交任务被取消：{}", e);
                Err(SubmitError::Interrupted(e.to_string()))
            }
        }
    }
}

impl PipelineInner {
    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<PendingWrite>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Idle` 时进入 `first` 状态；否则返回 `Busy`。
    fn begin(this: &Arc<Self>, first: PipelineState) -> Result<ActiveSubmission, SubmitError> {
        {
            let mut state = this.lock_state();
            if !state.is_idle() {
                log::warn!("⚠️ 流水线忙（{:?}），拒绝新的调用", *state);
                return Err(SubmitError::Busy);
            }
            *state = first.clone();
        }

        let id = this.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("提交 #{} 开始 -> {:?}", id, first);
        this.sink.on_state(&first);

        Ok(ActiveSubmission {
            pipeline: Arc::clone(this),
            id,
        })
    }

    fn transition(&self, next: PipelineState) {
        {
            let mut state = self.lock_state();
            if *state == next {
                return;
            }
            log::debug!("状态迁移：{:?} -> {:?}", *state, next);
            *state = next.clone();
        }
        self.sink.on_state(&next);
    }

    async fn run_submission(
        &self,
        source: ImageSource,
        timings: &mut StageTimings,
    ) -> Result<AnalysisRecord, SubmitError> {
        let read_start = Instant::now();
        let limits = self.config.image.clone();
        let image = tokio::task::spawn_blocking(move || loader::prepare(source, &limits))
            .await
            .map_err(|e| InputError::Unreadable(format!("读取任务异常退出：{}", e)))??;
        timings.read = read_start.elapsed();

        self.transition(PipelineState::Inferring);
        let infer_start = Instant::now();
        let fields = self.classify_with_retry(&image).await?;
        timings.infer = infer_start.elapsed();

        self.transition(PipelineState::Persisting);
        let pending = PendingWrite {
            write_key: new_write_key(),
            fields,
        };
        self.persist_stage(pending, timings).await
    }

    async fn classify_with_retry(&self, image: &PreparedImage) -> Result<AnalysisFields, SubmitError> {
        let config = &self.config;
        let mut retry: u32 = 0;

        loop {
            let attempt_start = Instant::now();
            let outcome = match tokio::time::timeout(
                Duration::from_millis(config.inference_timeout_ms),
                self.inference.classify(&image.bytes, image.mime),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(InferenceError::Timeout(format!(
                    "模型请求超时（{}ms）",
                    config.inference_timeout_ms
                ))),
            };

            match outcome {
                Ok(fields) => {
                    fields.validate().map_err(InferenceError::from)?;
                    log::info!(
                        "🤖 推理成功 - 第 {} 次尝试 耗时: {}ms",
                        retry + 1,
                        attempt_start.elapsed().as_millis()
                    );
                    return Ok(fields);
                }
                Err(err) if err.is_transient() && retry < config.inference_retries => {
                    retry += 1;
                    let mut delay =
                        retry_delay(config.retry_base_delay_ms, retry, config.retry_max_delay_ms);
                    if let Some(hint_ms) = err.retry_after_ms() {
                        delay = delay.max(Duration::from_millis(hint_ms.min(config.retry_max_delay_ms)));
                    }
                    log::warn!(
                        "⚠️ 推理瞬时失败，{}ms 后重试（{}/{}）：{}",
                        delay.as_millis(),
                        retry,
                        config.inference_retries,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        log::error!("❌ 推理重试已耗尽（共 {} 次尝试）：{}", retry + 1, err);
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// 写入一次；失败时保留结果与写入键供 `retry_persist` 使用。
    async fn persist_stage(
        &self,
        pending: PendingWrite,
        timings: &mut StageTimings,
    ) -> Result<AnalysisRecord, SubmitError> {
        let persist_start = Instant::now();
        let timeout_ms = self.config.persist_timeout_ms;
        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.store.append_keyed(&pending.write_key, &pending.fields),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(PersistenceError::Timeout(format!("写入超时（{}ms）", timeout_ms))),
        };
        timings.persist = persist_start.elapsed();

        outcome.map_err(|err| {
            log::warn!("⚠️ 写入失败，分析结果已保留，可手动重试：{}", err);
            *self.lock_pending() = Some(pending);
            SubmitError::from(err)
        })
    }

    fn finish(
        &self,
        id: u64,
        result: Result<AnalysisRecord, SubmitError>,
        timings: &StageTimings,
        total_start: Instant,
    ) -> Result<AnalysisRecord, SubmitError> {
        match &result {
            Ok(record) => {
                self.transition(PipelineState::Succeeded);
                self.sink.notify(&SubmissionEvent::Success {
                    record: record.clone(),
                });
                self.refresh_tx.send_modify(|count| *count += 1);

                log::info!(
                    "✅ 提交 #{} 完成 - id: {} read={}ms infer={}ms persist={}ms total={}ms",
                    id,
                    record.id,
                    timings.read.as_millis(),
                    timings.infer.as_millis(),
                    timings.persist.as_millis(),
                    total_start.elapsed().as_millis()
                );
            }
            Err(err) => {
                if let Some(event) = SubmissionEvent::from_error(err) {
                    if let SubmissionEvent::Failure { stage, code, message } = &event {
                        self.transition(PipelineState::Failed {
                            stage: *stage,
                            code: *code,
                            message: message.clone(),
                        });
                    }
                    self.sink.notify(&event);
                }

                log::warn!(
                    "❌ 提交 #{} 失败 - code: {} {} total={}ms",
                    id,
                    err.code(),
                    err,
                    total_start.elapsed().as_millis()
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ImageMime;
    use crate::store::SqliteRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FixedClient;

    #[async_trait]
    impl InferenceClient for FixedClient {
        async fn classify(&self, _image: &[u8], _mime: ImageMime) -> Result<AnalysisFields, InferenceError> {
            Ok(AnalysisFields {
                animal_kind: "goat".to_string(),
                breed: "boer".to_string(),
                body_type: "muscular".to_string(),
                frame_type: "medium".to_string(),
                estimated_weight: 80.0,
                weight_range: "70-100kg".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingSink {
        events: AtomicUsize,
    }

    impl NotificationSink for CountingSink {
        fn notify(&self, _event: &SubmissionEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 255]));
        let mut cursor = std::io::Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).expect("encode fixture");
        cursor.into_inner()
    }

    #[tokio::test]
    async fn success_signals_refresh_and_returns_to_idle() {
        let sink = Arc::new(CountingSink::default());
        let pipeline = SubmissionPipeline::new(
            Arc::new(FixedClient),
            Arc::new(SqliteRecordStore::open_in_memory().expect("open store")),
            sink.clone(),
            PipelineConfig::default(),
        );
        let mut refresh = pipeline.subscribe_refresh();

        let record = pipeline.submit_bytes(png(), Some("image/png")).await.expect("submit");

        assert_eq!(record.fields.breed, "boer");
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(sink.events.load(Ordering::SeqCst), 1);
        assert!(refresh.has_changed().expect("sender alive"));
        assert_eq!(*refresh.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn retry_persist_without_pending_result_is_rejected() {
        let pipeline = SubmissionPipeline::new(
            Arc::new(FixedClient),
            Arc::new(SqliteRecordStore::open_in_memory().expect("open store")),
            Arc::new(CountingSink::default()),
            PipelineConfig::default(),
        );

        assert!(matches!(pipeline.retry_persist().await, Err(SubmitError::NothingToRetry)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}
