//! 日志初始化。
//!
//! 统一使用 `log` 门面，默认级别 `info`，可通过 `RUST_LOG` 覆盖。

/// 安装 `env_logger`；重复调用不会报错。
pub fn init_logging() {
    let initialized = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init()
        .is_ok();

    if initialized {
        log::debug!("日志已初始化");
    }
}
