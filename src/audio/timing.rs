//! 单调时钟
//!
//! 为 refill 回调提供展示时间提示（纳秒）。
//! 时间基准在进程内首次调用时固定，之后只增不减。

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 进程内时间原点（全局缓存，只初始化一次）
static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// 获取当前时间（纳秒，相对进程时间原点）
#[inline]
pub fn now_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// 将秒数转换为纳秒（负数和 NaN 截断为 0）
#[inline]
pub fn secs_to_ns(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1_000_000_000.0).round() as u64
    } else {
        0
    }
}

/// 从 `now_ns()` 的取值还原为 `Duration`
#[inline]
pub fn ns_to_duration(ns: u64) -> Duration {
    Duration::from_nanos(ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let t1 = now_ns();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = now_ns();

        assert!(t2 > t1, "time should advance");
        // 至少 10ms，留出调度误差
        assert!(
            t2 - t1 >= 8_000_000,
            "expected at least 8ms, got {}ns",
            t2 - t1
        );
    }

    #[test]
    fn test_secs_to_ns() {
        assert_eq!(secs_to_ns(0.05), 50_000_000);
        assert_eq!(secs_to_ns(-1.0), 0);
        assert_eq!(secs_to_ns(f64::NAN), 0);
        assert_eq!(ns_to_duration(secs_to_ns(1.5)), Duration::from_millis(1500));
    }
}
