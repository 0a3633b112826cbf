//! 音频输出核心模块
//!
//! 包含：
//! - Format: 格式协商与样本打包
//! - Buffer: period buffer 分配
//! - Backend: 平台后端抽象（engine / output mix / player）
//! - Refill: buffer queue 回调
//! - Output: 会话生命周期与播放状态控制
//! - Sim: 进程内模拟后端
//! - Stats / Timing / Tone

pub mod backend;
pub mod buffer;
pub mod format;
pub mod output;
pub mod refill;
pub mod sim;
pub mod stats;
pub mod timing;
pub mod tone;

pub use backend::{Backend, BackendCaps, BackendError, PlayState, PrimeMode, ResetMode};
pub use format::{AudioFormat, ChannelPolicy, SampleFormat};
pub use output::{OutputConfig, OutputError, Session, SetupStep};
pub use refill::{Pipeline, PipelineStatus};
pub use sim::SimBackend;
pub use stats::{PlaybackStats, StatsReport};
pub use tone::ToneGenerator;
