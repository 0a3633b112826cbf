//! Period buffer
//!
//! 一个 period 的音频（默认 50ms）对应一块固定大小的字节缓冲区，
//! 整个会话期间复用。大小 = frames_per_period × channels × bytes_per_sample。
//!
//! 设计约束：
//! - 只在会话建立阶段分配一次（第一次入队之前）
//! - 播放期间大小不变，只由 refill 回调写入
//! - 可选 mlock 防止 page fault

use super::output::OutputError;

/// 默认 period 时长（毫秒）
pub const DEFAULT_PERIOD_MS: u32 = 50;

/// 计算每个 period 的帧数
///
/// `configured` 为外部指定的帧数，否则按默认 period 时长换算。
pub fn frames_per_period(sample_rate: u32, configured: Option<u32>) -> usize {
    match configured {
        Some(frames) => frames as usize,
        None => {
            let frames = sample_rate as u64 * DEFAULT_PERIOD_MS as u64 / 1000;
            (frames as usize).max(1)
        }
    }
}

/// 会话独占的 period buffer
pub struct PeriodBuffer {
    data: Vec<u8>,
    frames: usize,
    bytes_per_frame: usize,
    /// 是否已锁定内存
    memory_locked: bool,
}

impl PeriodBuffer {
    /// 分配零填充的 period buffer
    ///
    /// 内存不足（或大小溢出）时返回 `ResourceExhausted`，不会 abort
    pub fn allocate(
        frames: usize,
        channels: usize,
        bytes_per_sample: usize,
    ) -> Result<Self, OutputError> {
        let bytes_per_frame = channels
            .checked_mul(bytes_per_sample)
            .ok_or(OutputError::ResourceExhausted(usize::MAX))?;
        let size = frames
            .checked_mul(bytes_per_frame)
            .ok_or(OutputError::ResourceExhausted(usize::MAX))?;

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| OutputError::ResourceExhausted(size))?;
        data.resize(size, 0);

        log::debug!(
            "Period buffer allocated: {} frames × {} bytes = {} bytes",
            frames,
            bytes_per_frame,
            size
        );

        Ok(Self {
            data,
            frames,
            bytes_per_frame,
            memory_locked: false,
        })
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }
        if self.data.is_empty() {
            return false;
        }

        let ptr = self.data.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.data.len()) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Period buffer memory locked: {} bytes", self.data.len());
            true
        } else {
            log::warn!(
                "Failed to lock period buffer memory ({})",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.data.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.data.len());
        }

        self.memory_locked = false;
        log::debug!("Period buffer memory unlocked");
    }

    #[inline]
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }

    /// 字节数
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 每 period 的帧数
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 只有 refill 回调可以写入
    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PeriodBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
        log::debug!("Period buffer released: {} bytes", self.data.len());
    }
}
