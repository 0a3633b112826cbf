//! 播放统计模块
//!
//! 在 refill 回调中收集统计信息，所有操作都是 lock-free 的

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// 播放统计收集器
pub struct PlaybackStats {
    /// 回调线程高频写入，独占 cache line
    refills: CachePadded<AtomicU64>,
    bytes_submitted: CachePadded<AtomicU64>,
    last_presentation_ns: CachePadded<AtomicU64>,

    submissions: AtomicU64,
    underruns: AtomicU64,
    submission_errors: AtomicU64,
    /// 控制线程的 priming 入队次数
    primes: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            refills: CachePadded::new(AtomicU64::new(0)),
            bytes_submitted: CachePadded::new(AtomicU64::new(0)),
            last_presentation_ns: CachePadded::new(AtomicU64::new(0)),
            submissions: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            submission_errors: AtomicU64::new(0),
            primes: AtomicU64::new(0),
        }
    }

    /// 每次 refill 开始时调用
    #[inline]
    pub fn on_refill(&self, presentation_ns: u64) {
        self.refills.fetch_add(1, Ordering::Relaxed);
        self.last_presentation_ns
            .store(presentation_ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_submission(&self, bytes: usize) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.bytes_submitted
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 管线返回的数据少于请求量
    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_submission_error(&self) {
        self.submission_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_prime(&self) {
        self.primes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn refill_count(&self) -> u64 {
        self.refills.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_submitted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn submission_error_count(&self) -> u64 {
        self.submission_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn prime_count(&self) -> u64 {
        self.primes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_presentation_ns(&self) -> u64 {
        self.last_presentation_ns.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `bytes_per_second` 用于把已提交字节换算为播放时长
    pub fn report(&self, bytes_per_second: usize) -> StatsReport {
        let bytes = self.bytes_submitted();
        let seconds_submitted = if bytes_per_second > 0 {
            bytes as f64 / bytes_per_second as f64
        } else {
            0.0
        };

        StatsReport {
            refills: self.refill_count(),
            submissions: self.submission_count(),
            bytes_submitted: bytes,
            seconds_submitted,
            underruns: self.underrun_count(),
            submission_errors: self.submission_error_count(),
            primes: self.prime_count(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.refills.store(0, Ordering::Relaxed);
        self.bytes_submitted.store(0, Ordering::Relaxed);
        self.last_presentation_ns.store(0, Ordering::Relaxed);
        self.submissions.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.submission_errors.store(0, Ordering::Relaxed);
        self.primes.store(0, Ordering::Relaxed);
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub refills: u64,
    pub submissions: u64,
    pub bytes_submitted: u64,
    pub seconds_submitted: f64,
    pub underruns: u64,
    pub submission_errors: u64,
    pub primes: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Refill callbacks: {}", self.refills)?;
        writeln!(f, "Priming enqueues: {}", self.primes)?;
        writeln!(f, "Submissions: {}", self.submissions)?;
        writeln!(
            f,
            "Bytes submitted: {} ({:.2} s of audio)",
            self.bytes_submitted, self.seconds_submitted
        )?;
        writeln!(f, "Short pulls: {}", self.underruns)?;
        writeln!(f, "Submission errors: {}", self.submission_errors)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_and_duration() {
        let stats = PlaybackStats::new();
        stats.on_refill(10);
        stats.record_submission(8820);
        stats.on_refill(20);
        stats.record_submission(8820);
        stats.record_underrun();
        stats.record_prime();

        let report = stats.report(44100 * 4);
        assert_eq!(report.refills, 2);
        assert_eq!(report.submissions, 2);
        assert_eq!(report.bytes_submitted, 17640);
        assert!((report.seconds_submitted - 0.1).abs() < 1e-9);
        assert_eq!(report.underruns, 1);
        assert_eq!(report.primes, 1);
        assert_eq!(stats.last_presentation_ns(), 20);

        let text = report.to_string();
        assert!(text.contains("Submissions: 2"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = PlaybackStats::new();
        stats.on_refill(5);
        stats.record_submission_error();
        stats.reset();
        assert_eq!(stats.refill_count(), 0);
        assert_eq!(stats.submission_error_count(), 0);
        assert_eq!(stats.last_presentation_ns(), 0);
    }
}
