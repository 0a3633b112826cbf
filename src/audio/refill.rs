//! Refill 回调
//!
//! 后端每播放完一个 buffer 就在自己的线程上调用一次：
//! 1. 计算即将提交的 buffer 代表的延迟
//! 2. 从管线拉取至多一个 period 的数据，附带展示时间提示 now + delay
//! 3. 把实际拿到的字节重新入队
//! 4. 入队失败只记录，不在回调内重试（队列随之停转，下次检查状态时暴露）
//!
//! **并发约定：**
//! - 运行阶段 period buffer 只由这里写入
//! - 每次访问 buffer 前检查阶段标记，非 Running 直接返回
//! - busy 标记保证同一时刻只有一个 refill 在执行（回调线程或同步 priming）

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::backend::{Backend, BackendError, InterfaceId};
use super::buffer::PeriodBuffer;
use super::format::AudioFormat;
use super::stats::PlaybackStats;
use super::timing::{now_ns, secs_to_ns};

/// 上游音频管线
///
/// 按协商好的格式产出字节，驱动本身不做任何格式转换。
pub trait Pipeline: Send {
    /// 格式协商完成后、第一次 pull 之前调用一次
    fn configure(&mut self, _format: &AudioFormat) {}

    /// 向 `out` 写入至多 `out.len()` 字节，返回实际写入的字节数
    ///
    /// `presentation_ns` 是这批数据预计被听到的时刻（[`super::timing::now_ns`] 时基）
    fn pull(&mut self, out: &mut [u8], presentation_ns: u64) -> usize;
}

/// 管线进度，由管线写入、控制线程读取
#[derive(Debug, Default)]
pub struct PipelineStatus {
    frames: AtomicU64,
    finished: AtomicBool,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录已产出的帧数
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// 数据源已耗尽
    #[inline]
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// 会话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// 只有控制线程访问
    Setup = 0,
    /// 回调线程是 buffer 的唯一写者
    Running = 1,
    /// 后端对象正在销毁，buffer 不可再访问
    Teardown = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Setup,
            1 => Self::Running,
            _ => Self::Teardown,
        }
    }
}

/// 一次 refill 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillOutcome {
    /// 已入队的字节数
    Submitted(usize),
    /// 阶段不对或已有 refill 在执行
    Skipped,
    /// 入队失败
    Failed(BackendError),
}

/// 回调独占的状态
struct RefillState {
    buffer: PeriodBuffer,
    pipeline: Box<dyn Pipeline>,
    backend: Arc<dyn Backend>,
    queue: InterfaceId,
    bytes_per_second: f64,
    /// 上次 pull 剩下的不足一帧的字节，下次提交时放在最前面
    tail: Vec<u8>,
}

/// Refill 回调上下文
///
/// 由后端回调闭包和 Session 共同持有（`Arc`）。
/// buffer 在最后一个引用释放时才被回收，Session 保证这发生在 player 销毁之后。
pub struct RefillContext {
    phase: CachePadded<AtomicU8>,
    busy: CachePadded<AtomicBool>,
    /// 入队失败后置位，直到下一次成功入队或 resume
    stalled: AtomicBool,
    stall_code: AtomicU32,
    stats: Arc<PlaybackStats>,
    state: UnsafeCell<RefillState>,
}

// state 只在持有 busy 标记时访问
unsafe impl Sync for RefillContext {}

impl RefillContext {
    pub fn new(
        buffer: PeriodBuffer,
        pipeline: Box<dyn Pipeline>,
        backend: Arc<dyn Backend>,
        queue: InterfaceId,
        format: &AudioFormat,
        stats: Arc<PlaybackStats>,
    ) -> Self {
        let tail = Vec::with_capacity(buffer.bytes_per_frame());
        Self {
            phase: CachePadded::new(AtomicU8::new(Phase::Setup as u8)),
            busy: CachePadded::new(AtomicBool::new(false)),
            stalled: AtomicBool::new(false),
            stall_code: AtomicU32::new(0),
            stats,
            state: UnsafeCell::new(RefillState {
                buffer,
                pipeline,
                backend,
                queue,
                bytes_per_second: format.bytes_per_second() as f64,
                tail,
            }),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// 队列是否因入队失败而停转
    pub fn stall(&self) -> Option<BackendError> {
        if self.stalled.load(Ordering::Acquire) {
            Some(
                BackendError::from_code(self.stall_code.load(Ordering::Relaxed))
                    .err()
                    .unwrap_or(BackendError::Internal),
            )
        } else {
            None
        }
    }

    pub fn clear_stall(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    /// 执行一次 refill
    ///
    /// 后端回调和同步 priming 都走这里。
    pub fn run(&self) -> RefillOutcome {
        if self.phase() != Phase::Running {
            return RefillOutcome::Skipped;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefillOutcome::Skipped;
        }

        // 持有 busy 标记，独占 state
        let state = unsafe { &mut *self.state.get() };
        let outcome = Self::refill(state, &self.stats);

        self.busy.store(false, Ordering::Release);

        match outcome {
            RefillOutcome::Failed(err) => {
                self.stall_code.store(err.code(), Ordering::Relaxed);
                self.stalled.store(true, Ordering::Release);
            }
            // 回调链仍在运转
            RefillOutcome::Submitted(_) => self.clear_stall(),
            RefillOutcome::Skipped => {}
        }
        outcome
    }

    fn refill(state: &mut RefillState, stats: &PlaybackStats) -> RefillOutcome {
        let len = state.buffer.len();
        let bytes_per_frame = state.buffer.bytes_per_frame();

        // 这个 buffer 代表的播放延迟
        let delay = len as f64 / state.bytes_per_second;
        let presentation_ns = now_ns() + secs_to_ns(delay);
        stats.on_refill(presentation_ns);

        let data = state.buffer.as_mut_slice();
        let carried = state.tail.len();
        data[..carried].copy_from_slice(&state.tail);
        state.tail.clear();

        let written = state
            .pipeline
            .pull(&mut data[carried..], presentation_ns)
            .min(len - carried);
        let filled = carried + written;

        // 只提交完整帧，不补静音；不足一帧的尾部留给下一次
        let mut submit = filled - filled % bytes_per_frame;
        state.tail.extend_from_slice(&data[submit..filled]);
        if submit < len {
            stats.record_underrun();
        }
        if submit == 0 {
            // 后端拒绝零长度入队，没有完整帧时提交一帧静音，保持回调链不断
            data[..bytes_per_frame].fill(0);
            submit = bytes_per_frame;
        }

        match state
            .backend
            .enqueue(state.queue, &state.buffer.as_slice()[..submit])
        {
            Ok(()) => {
                stats.record_submission(submit);
                RefillOutcome::Submitted(submit)
            }
            Err(err) => {
                log::error!("Failed to Enqueue {} bytes: {}", submit, err);
                stats.record_submission_error();
                RefillOutcome::Failed(err)
            }
        }
    }
}
