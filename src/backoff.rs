//! # 退避与抖动
//!
//! 指数退避 + 随机抖动，供推理阶段的瞬时失败重试使用。
//!
//! 抖动值取自 splitmix64：全局计数器每次前进一个黄金分割步长，
//! 与当前纳秒时间混合后输出。多个并发重试即便在同一时刻触发也会拿到不同的值。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(0);

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn jitter_sample() -> u64 {
    let step = JITTER_COUNTER.fetch_add(GOLDEN_GAMMA, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    splitmix64(step.wrapping_add(GOLDEN_GAMMA) ^ nanos)
}

/// 计算第 `retry` 次重试（从 1 开始）前的等待时长。
///
/// 基础值为 `base_delay_ms * 2^(retry-1)`，封顶 `max_delay_ms`，
/// 再叠加不超过封顶值 1/4 的抖动。
pub(crate) fn retry_delay(base_delay_ms: u64, retry: u32, max_delay_ms: u64) -> Duration {
    let exp = base_delay_ms.saturating_mul(1_u64 << retry.saturating_sub(1).min(16));
    let capped = exp.min(max_delay_ms.max(base_delay_ms));
    let jitter_bound = capped / 4;
    let jitter = if jitter_bound == 0 {
        0
    } else {
        jitter_sample() % (jitter_bound + 1)
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::retry_delay;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn first_retry_starts_at_base_delay() {
        let delay = retry_delay(1_000, 1, 8_000);
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay <= Duration::from_millis(1_250));
    }

    #[test]
    fn second_retry_doubles() {
        let delay = retry_delay(1_000, 2, 8_000);
        assert!(delay >= Duration::from_millis(2_000));
        assert!(delay <= Duration::from_millis(2_500));
    }

    #[test]
    fn consecutive_samples_differ() {
        let samples: std::collections::HashSet<u64> = (0..64).map(|_| super::jitter_sample()).collect();
        assert_eq!(samples.len(), 64);
    }

    #[test]
    fn zero_base_delay_means_no_wait() {
        assert_eq!(retry_delay(0, 3, 0), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn delay_stays_within_cap_plus_jitter(base in 1u64..5_000, retry in 1u32..40, cap in 1u64..60_000) {
            let delay = retry_delay(base, retry, cap).as_millis() as u64;
            let ceiling = cap.max(base);

            prop_assert!(delay >= base.min(ceiling));
            prop_assert!(delay <= ceiling + ceiling / 4);
        }
    }
}
