//! 平台音频后端抽象
//!
//! 对应 OpenSL ES 风格的对象模型：engine / output mix / player 三类对象，
//! 每个对象先创建、再 realize，之后才能获取接口。
//! 驱动只依赖这里的窄接口，具体后端（真实平台或 [`super::sim`]）在外部实现。

use thiserror::Error;

use super::format::{ChannelPolicy, PcmDescriptor, SampleFormat};

/// 后端对象句柄（不透明）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// 后端接口句柄（不透明）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub u32);

/// 对象类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Engine,
    OutputMix,
    Player,
}

/// 接口类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Engine,
    Play,
    BufferQueue,
}

/// 播放状态（数值与 SL_PLAYSTATE_* 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    Stopped = 1,
    Paused = 2,
    Playing = 3,
}

/// Buffer queue 数据定位器
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferQueueLocator {
    /// 队列中可同时存在的 buffer 数
    pub num_buffers: u32,
}

/// Player 的数据源：buffer queue + PCM 格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub locator: BufferQueueLocator,
    pub format: PcmDescriptor,
}

/// Player 的数据汇：output mix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkDescriptor {
    pub output_mix: ObjectId,
}

/// Buffer 播放完毕时由后端调用的回调
///
/// 在后端自己的线程上执行，与控制线程并发。
pub type RefillCallback = Box<dyn FnMut() + Send + 'static>;

/// reset 时后端能做到的程度
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// 真正停止并清空队列
    Stop,
    /// 只能暂停，队列保留
    Pause,
}

/// 切换到 Playing 后启动回调链的方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimeMode {
    /// 入队一个静音标记 buffer，等后端回调
    Marker,
    /// 在控制线程上同步执行一次 refill
    Synchronous,
}

/// 后端能力
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendCaps {
    /// 后端接受的 PCM 格式（[`super::format::FORMAT_MAP`] 的子集）
    pub formats: Vec<SampleFormat>,
    pub channels: ChannelPolicy,
    pub reset: ResetMode,
    pub prime: PrimeMode,
}

impl Default for BackendCaps {
    fn default() -> Self {
        Self {
            formats: vec![SampleFormat::U8, SampleFormat::S16, SampleFormat::S32],
            channels: ChannelPolicy::StereoOnly,
            reset: ResetMode::Stop,
            prime: PrimeMode::Marker,
        }
    }
}

/// 后端调用错误（与 SL_RESULT_* 一一对应）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("preconditions violated")]
    PreconditionsViolated,
    #[error("parameter invalid")]
    ParameterInvalid,
    #[error("memory failure")]
    MemoryFailure,
    #[error("resource error")]
    ResourceError,
    #[error("resource lost")]
    ResourceLost,
    #[error("buffer insufficient")]
    BufferInsufficient,
    #[error("content unsupported")]
    ContentUnsupported,
    #[error("feature unsupported")]
    FeatureUnsupported,
    #[error("internal error")]
    Internal,
    #[error("result code {0}")]
    Other(u32),
}

impl BackendError {
    /// 从后端结果码转换，0 表示成功
    pub fn from_code(code: u32) -> Result<(), Self> {
        match code {
            0 => Ok(()),
            1 => Err(Self::PreconditionsViolated),
            2 => Err(Self::ParameterInvalid),
            3 => Err(Self::MemoryFailure),
            4 => Err(Self::ResourceError),
            5 => Err(Self::ResourceLost),
            7 => Err(Self::BufferInsufficient),
            9 => Err(Self::ContentUnsupported),
            12 => Err(Self::FeatureUnsupported),
            13 => Err(Self::Internal),
            other => Err(Self::Other(other)),
        }
    }

    /// 对应的后端结果码
    pub fn code(&self) -> u32 {
        match self {
            Self::PreconditionsViolated => 1,
            Self::ParameterInvalid => 2,
            Self::MemoryFailure => 3,
            Self::ResourceError => 4,
            Self::ResourceLost => 5,
            Self::BufferInsufficient => 7,
            Self::ContentUnsupported => 9,
            Self::FeatureUnsupported => 12,
            Self::Internal => 13,
            Self::Other(code) => *code,
        }
    }
}

/// 平台音频后端
///
/// 实现约定：
/// - `destroy` 返回前保证该对象的回调不再被调用（正在执行的回调要等它返回），
///   并丢弃已注册的回调
/// - 对 player 的 `enqueue` 数据在播放完毕或 player 销毁之前必须有效；
///   驱动保证 period buffer 在 player 销毁之后才释放
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> BackendCaps;

    fn create_engine(&self) -> Result<ObjectId, BackendError>;

    fn realize(&self, object: ObjectId) -> Result<(), BackendError>;

    fn get_interface(
        &self,
        object: ObjectId,
        kind: InterfaceKind,
    ) -> Result<InterfaceId, BackendError>;

    fn create_output_mix(&self, engine: InterfaceId) -> Result<ObjectId, BackendError>;

    fn create_player(
        &self,
        engine: InterfaceId,
        source: &SourceDescriptor,
        sink: &SinkDescriptor,
        required: &[InterfaceKind],
    ) -> Result<ObjectId, BackendError>;

    fn destroy(&self, object: ObjectId);

    fn enqueue(&self, queue: InterfaceId, data: &[u8]) -> Result<(), BackendError>;

    fn register_callback(
        &self,
        queue: InterfaceId,
        callback: RefillCallback,
    ) -> Result<(), BackendError>;

    fn set_play_state(&self, play: InterfaceId, state: PlayState) -> Result<(), BackendError>;
}
