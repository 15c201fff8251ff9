//! # 应用配置
//!
//! ## 设计思路
//!
//! 所有运行参数集中在 `AppConfig`，按组件分节：`pipeline` / `gemini` / `store` / `history`。
//! 配置文件为 JSON，缺省字段取默认值；密钥只从环境变量或配置文件读取，
//! 保存配置时不会写回磁盘。
//!
//! ## 实现思路
//!
//! 1. `load_config`：文件缺失或解析失败时回退默认值并记录日志
//! 2. `apply_env_overrides`：用环境变量覆盖密钥、模型、项目与存储后端
//! 3. `validate`：启动前做一次范围检查

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::history::HistoryConfig;
use crate::inference::GeminiConfig;
use crate::store::StoreConfig;
use crate::submission::PipelineConfig;

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub gemini: GeminiConfig,
    pub store: StoreConfig,
    pub history: HistoryConfig,
}

/// 读取配置文件；文件不存在或内容非法时返回默认配置。
pub fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        log::info!("配置文件不存在，使用默认配置: {}", path.display());
        return AppConfig::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("⚠️ 读取配置文件失败，使用默认配置: {} ({})", path.display(), e);
            return AppConfig::default();
        }
    };

    match serde_json::from_str::<AppConfig>(&content) {
        Ok(config) => {
            log::info!("已加载配置文件: {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("⚠️ 解析配置文件失败，使用默认配置: {} ({})", path.display(), e);
            AppConfig::default()
        }
    }
}

/// 以格式化 JSON 写出配置（不含密钥）。
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("序列化配置失败: {}", e)))?;
    fs::write(path, content)?;
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl AppConfig {
    /// 用进程环境变量覆盖配置。
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// 用任意键值来源覆盖配置（便于测试注入）。
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let gemini_key = non_empty(lookup("ANIMAL_SCAN_GEMINI_API_KEY"))
            .or_else(|| non_empty(lookup("GEMINI_API_KEY")));
        if let Some(key) = gemini_key {
            self.gemini.api_key = key;
        }
        if let Some(model) = non_empty(lookup("ANIMAL_SCAN_GEMINI_MODEL")) {
            self.gemini.model = model;
        }

        if let Some(path) = non_empty(lookup("ANIMAL_SCAN_SQLITE_PATH")) {
            log::info!("环境变量指定 SQLite 存储: {}", path);
            self.store = StoreConfig::Sqlite {
                path: PathBuf::from(path),
            };
        }

        if let StoreConfig::Firestore(firestore) = &mut self.store {
            if let Some(project) = non_empty(lookup("ANIMAL_SCAN_FIRESTORE_PROJECT")) {
                firestore.project_id = project;
            }
            if let Some(key) = non_empty(lookup("ANIMAL_SCAN_FIRESTORE_API_KEY")) {
                firestore.api_key = Some(key);
            }
            if let Some(token) = non_empty(lookup("ANIMAL_SCAN_FIRESTORE_TOKEN")) {
                firestore.bearer_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.pipeline.validate().map_err(AppError::Config)?;

        if self.gemini.api_key.trim().is_empty() {
            return Err(AppError::Config(
                "缺少 Gemini API Key（配置 gemini.api_key 或环境变量 GEMINI_API_KEY）".to_string(),
            ));
        }
        if self.gemini.model.trim().is_empty() {
            return Err(AppError::Config("gemini.model 不能为空".to_string()));
        }
        if !(1..=600).contains(&self.gemini.request_timeout_secs) {
            return Err(AppError::Config("gemini.request_timeout_secs 必须在 1~600 秒之间".to_string()));
        }

        if !(1..=MAX_PAGE_SIZE).contains(&self.history.page_size) {
            return Err(AppError::Config(format!(
                "history.page_size 必须在 1~{} 之间",
                MAX_PAGE_SIZE
            )));
        }
        if !(1_000..=600_000).contains(&self.history.load_timeout_ms) {
            return Err(AppError::Config(
                "history.load_timeout_ms 必须在 1000~600000 毫秒之间".to_string(),
            ));
        }

        match &self.store {
            StoreConfig::Firestore(firestore) => {
                if firestore.project_id.trim().is_empty() {
                    return Err(AppError::Config(
                        "缺少 Firestore 项目 ID（store.project_id 或 ANIMAL_SCAN_FIRESTORE_PROJECT）".to_string(),
                    ));
                }
                if !(1..=600).contains(&firestore.request_timeout_secs) {
                    return Err(AppError::Config(
                        "store.request_timeout_secs 必须在 1~600 秒之间".to_string(),
                    ));
                }
            }
            StoreConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(AppError::Config("store.path 不能为空".to_string()));
                }
            }
        }

        Ok(())
    }
}
