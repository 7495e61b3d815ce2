//! 重启退避策略

use std::time::Duration;

use serde::Deserialize;

/// 指数退避：第 n 次重启等待 `initial * multiplier^(n-1)`，上限 `max`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// attempt 从 1 开始；multiplier 小于 1 时按 1 处理，保证延迟单调不减
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_ms as f64 * multiplier.powi(exponent);
        let capped = raw.min(self.max_ms.max(self.initial_ms) as f64);
        Duration::from_millis(capped as u64)
    }
}
