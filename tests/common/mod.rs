//! 集成测试共用的假实现与图片夹具。
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};

use animal_scan::inference::{InferenceClient, InferenceError};
use animal_scan::media::ImageMime;
use animal_scan::record::{AnalysisFields, AnalysisRecord};
use animal_scan::store::{Page, PaginationCursor, PersistenceError, RecordStore, SqliteRecordStore};
use animal_scan::submission::{NotificationSink, PipelineConfig, PipelineState, SubmissionEvent};

pub fn beagle() -> AnalysisFields {
    AnalysisFields {
        animal_kind: "dog".to_string(),
        breed: "beagle".to_string(),
        body_type: "lean".to_string(),
        frame_type: "medium".to_string(),
        estimated_weight: 12.5,
        weight_range: "10-14kg".to_string(),
    }
}

pub fn fields(breed: &str) -> AnalysisFields {
    AnalysisFields {
        breed: breed.to_string(),
        ..beagle()
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 255) as u8, (y % 255) as u8, ((x + y) % 255) as u8, 255])
    });
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("encode png fixture failed");
    cursor.into_inner()
}

/// 退避很短的流水线配置，保证测试快速结束。
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        inference_timeout_ms: 2_000,
        persist_timeout_ms: 2_000,
        ..PipelineConfig::default()
    }
}

struct Step {
    delay: Duration,
    result: Result<AnalysisFields, InferenceError>,
}

/// 按脚本依次返回结果的推理客户端；脚本用完后返回 beagle。
#[derive(Default)]
pub struct ScriptedInference {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    seen_mimes: Mutex<Vec<ImageMime>>,
}

impl ScriptedInference {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn then(self: &Arc<Self>, result: Result<AnalysisFields, InferenceError>) -> &Arc<Self> {
        self.then_after(Duration::ZERO, result)
    }

    pub fn then_after(
        self: &Arc<Self>,
        delay: Duration,
        result: Result<AnalysisFields, InferenceError>,
    ) -> &Arc<Self> {
        self.steps.lock().expect("steps lock").push_back(Step { delay, result });
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_mimes(&self) -> Vec<ImageMime> {
        self.seen_mimes.lock().expect("mimes lock").clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn classify(&self, image: &[u8], mime: ImageMime) -> Result<AnalysisFields, InferenceError> {
        assert!(!image.is_empty(), "pipeline must never send empty images");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_mimes.lock().expect("mimes lock").push(mime);

        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(step) => {
                if !step.delay.is_zero() {
                    tokio::time::sleep(step.delay).await;
                }
                step.result
            }
            None => Ok(beagle()),
        }
    }
}

/// 内存 SQLite 存储外加故障注入与调用计数。
pub struct CountingStore {
    inner: SqliteRecordStore,
    append_calls: AtomicUsize,
    page_calls: AtomicUsize,
    append_failures: AtomicUsize,
    append_delay_ms: AtomicU64,
    page_delay_ms: AtomicU64,
    write_keys: Mutex<Vec<String>>,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteRecordStore::open_in_memory().expect("open in-memory store"),
            append_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
            append_failures: AtomicUsize::new(0),
            append_delay_ms: AtomicU64::new(0),
            page_delay_ms: AtomicU64::new(0),
            write_keys: Mutex::new(Vec::new()),
        })
    }

    /// 接下来 `count` 次写入返回网络错误。
    pub fn fail_next_appends(&self, count: usize) {
        self.append_failures.store(count, Ordering::SeqCst);
    }

    pub fn delay_appends(&self, delay: Duration) {
        self.append_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_pages(&self, delay: Duration) {
        self.page_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    /// 每次带键写入使用的写入键（按调用顺序）。
    pub fn write_keys(&self) -> Vec<String> {
        self.write_keys.lock().expect("keys lock").clone()
    }

    pub async fn stored(&self) -> Vec<AnalysisRecord> {
        self.inner.page(None, 100).await.expect("read stored records").records
    }

    /// 计数、延迟与故障注入。
    async fn before_append(&self) -> Result<(), PersistenceError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let should_fail = self
            .append_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(PersistenceError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    /// 绕过计数直接写入。
    pub async fn seed(&self, breeds: &[&str]) -> Vec<AnalysisRecord> {
        let mut records = Vec::new();
        for breed in breeds {
            records.push(self.inner.append(&fields(breed)).await.expect("seed append"));
        }
        records
    }
}

#[async_trait]
impl RecordStore for CountingStore {
    async fn append(&self, fields: &AnalysisFields) -> Result<AnalysisRecord, PersistenceError> {
        self.before_append().await?;
        self.inner.append(fields).await
    }

    async fn append_keyed(
        &self,
        write_key: &str,
        fields: &AnalysisFields,
    ) -> Result<AnalysisRecord, PersistenceError> {
        self.write_keys.lock().expect("keys lock").push(write_key.to_string());
        self.before_append().await?;
        self.inner.append_keyed(write_key, fields).await
    }

    async fn page(
        &self,
        cursor: Option<&PaginationCursor>,
        page_size: usize,
    ) -> Result<Page, PersistenceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.page_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.inner.page(cursor, page_size).await
    }
}

/// 记录全部事件与状态迁移的接收方。
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SubmissionEvent>>,
    states: Mutex<Vec<PipelineState>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SubmissionEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn states(&self) -> Vec<PipelineState> {
        self.states.lock().expect("states lock").clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: &SubmissionEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }

    fn on_state(&self, state: &PipelineState) {
        self.states.lock().expect("states lock").push(state.clone());
    }
}
