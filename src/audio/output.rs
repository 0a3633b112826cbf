//! Buffer queue 音频输出
//!
//! 一个 [`Session`] 对应一次设备打开：
//! - 按固定顺序构建 engine → output mix → player，任一步失败都回滚已构建的对象
//! - 协商格式、分配 period buffer、注册 refill 回调
//! - resume / reset 控制播放状态，resume 之后必须 prime 一次队列才会有回调
//! - close 时先销毁后端对象，再释放 buffer
//!
//! 回调线程与控制线程之间没有锁，靠 [`Phase`] 做阶段隔离。

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use thiserror::Error;

use super::backend::{
    Backend, BackendCaps, BackendError, BufferQueueLocator, InterfaceId, InterfaceKind,
    ObjectId, ObjectKind, PlayState, PrimeMode, ResetMode, SinkDescriptor, SourceDescriptor,
};
use super::buffer::{frames_per_period, PeriodBuffer};
use super::format::{negotiate, AudioFormat, PcmDescriptor, SampleFormat};
use super::refill::{Phase, Pipeline, RefillContext, RefillOutcome};
use super::stats::PlaybackStats;

/// 驱动名称
pub const DRIVER_NAME: &str = "opensles";
/// 驱动描述
pub const DRIVER_DESCRIPTION: &str = "OpenSL ES audio output";

/// `frames_per_buffer` 允许的范围
pub const FRAMES_PER_BUFFER_RANGE: RangeInclusive<u32> = 1..=10_000;
/// `sample_rate` 覆盖值允许的范围
pub const SAMPLE_RATE_RANGE: RangeInclusive<u32> = 1_000..=100_000;

/// player 的 buffer queue 深度
const NUM_BUFFERS: u32 = 1;

/// 输出配置
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputConfig {
    /// 每个 period 的帧数（None 表示按 50ms 计算）
    pub frames_per_buffer: Option<u32>,
    /// 固定输出采样率（None 表示使用管线的采样率）
    pub sample_rate: Option<u32>,
    /// 是否 mlock period buffer
    pub lock_memory: bool,
}

impl OutputConfig {
    /// 检查可调参数是否在允许范围内
    pub fn validate(&self) -> Result<(), OutputError> {
        if let Some(frames) = self.frames_per_buffer {
            if !FRAMES_PER_BUFFER_RANGE.contains(&frames) {
                return Err(OutputError::InvalidConfig(format!(
                    "frames_per_buffer {} out of range {}..={}",
                    frames,
                    FRAMES_PER_BUFFER_RANGE.start(),
                    FRAMES_PER_BUFFER_RANGE.end()
                )));
            }
        }
        if let Some(rate) = self.sample_rate {
            if !SAMPLE_RATE_RANGE.contains(&rate) {
                return Err(OutputError::InvalidConfig(format!(
                    "sample_rate {} out of range {}..={}",
                    rate,
                    SAMPLE_RATE_RANGE.start(),
                    SAMPLE_RATE_RANGE.end()
                )));
            }
        }
        Ok(())
    }
}

/// 会话构建步骤
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStep {
    CreateEngine,
    RealizeEngine,
    GetEngineInterface,
    CreateOutputMix,
    RealizeOutputMix,
    CreatePlayer,
    RealizePlayer,
    GetPlayInterface,
    GetQueueInterface,
    RegisterCallback,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateEngine => "create engine",
            Self::RealizeEngine => "realize engine",
            Self::GetEngineInterface => "get engine interface",
            Self::CreateOutputMix => "create output mix",
            Self::RealizeOutputMix => "realize output mix",
            Self::CreatePlayer => "create audio player",
            Self::RealizePlayer => "realize audio player",
            Self::GetPlayInterface => "get play interface",
            Self::GetQueueInterface => "get buffer queue interface",
            Self::RegisterCallback => "register refill callback",
        };
        f.write_str(name)
    }
}

/// 音频输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to {step}: {source}")]
    Setup {
        step: SetupStep,
        source: BackendError,
    },
    #[error("no backend encoding available for {0} samples")]
    UnsupportedFormat(SampleFormat),
    #[error("{0} channels not supported by backend")]
    UnsupportedChannels(u16),
    #[error("failed to allocate {0} byte period buffer")]
    ResourceExhausted(usize),
    #[error("failed to set play state to {state:?}: {source}")]
    Transition {
        state: PlayState,
        source: BackendError,
    },
    #[error("buffer queue stalled: {0}")]
    Submission(BackendError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 后端对象的所有权包装
///
/// `release` 可以重复调用，只有第一次会真正销毁。
pub struct BackendObject {
    backend: Arc<dyn Backend>,
    kind: ObjectKind,
    id: Option<ObjectId>,
}

impl BackendObject {
    fn new(backend: Arc<dyn Backend>, kind: ObjectKind, id: ObjectId) -> Self {
        Self {
            backend,
            kind,
            id: Some(id),
        }
    }

    #[inline]
    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.backend.destroy(id);
            log::debug!("{:?} object destroyed", self.kind);
        }
    }
}

impl Drop for BackendObject {
    fn drop(&mut self) {
        self.release();
    }
}

/// 会话持有的全部后端对象和接口
///
/// 释放顺序与构建顺序相反：player → output mix → engine。
pub struct BackendGraph {
    backend: Arc<dyn Backend>,
    engine: Option<BackendObject>,
    engine_itf: Option<InterfaceId>,
    output_mix: Option<BackendObject>,
    player: Option<BackendObject>,
    play_itf: Option<InterfaceId>,
    queue_itf: Option<InterfaceId>,
}

impl BackendGraph {
    fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            engine: None,
            engine_itf: None,
            output_mix: None,
            player: None,
            play_itf: None,
            queue_itf: None,
        }
    }

    /// 包装刚创建的对象，之后任何路径上都会被释放
    fn adopt(&self, kind: ObjectKind, id: ObjectId) -> BackendObject {
        BackendObject::new(Arc::clone(&self.backend), kind, id)
    }

    #[inline]
    pub fn play_interface(&self) -> Option<InterfaceId> {
        self.play_itf
    }

    #[inline]
    pub fn queue_interface(&self) -> Option<InterfaceId> {
        self.queue_itf
    }

    /// 是否所有对象都已释放
    pub fn is_empty(&self) -> bool {
        self.engine.is_none() && self.output_mix.is_none() && self.player.is_none()
    }

    pub fn release(&mut self) {
        self.play_itf = None;
        self.queue_itf = None;
        if let Some(mut player) = self.player.take() {
            player.release();
        }
        if let Some(mut mix) = self.output_mix.take() {
            mix.release();
        }
        self.engine_itf = None;
        if let Some(mut engine) = self.engine.take() {
            engine.release();
        }
    }
}

impl Drop for BackendGraph {
    fn drop(&mut self) {
        self.release();
    }
}

/// 后端调用失败 → 带步骤信息的 Setup 错误
fn step<T>(step: SetupStep, result: Result<T, BackendError>) -> Result<T, OutputError> {
    result.map_err(|source| {
        log::error!("Failed to {}: {}", step, source);
        OutputError::Setup { step, source }
    })
}

/// 构建阶段得到的、注册回调之前的部件
struct Prepared {
    format: AudioFormat,
    pcm: PcmDescriptor,
    buffer: PeriodBuffer,
    play: InterfaceId,
    queue: InterfaceId,
}

/// 一次打开的输出会话
pub struct Session {
    backend: Arc<dyn Backend>,
    caps: BackendCaps,
    graph: BackendGraph,
    /// 与回调闭包共享；close 时在后端对象销毁之后释放
    context: Option<Arc<RefillContext>>,
    format: AudioFormat,
    pcm: PcmDescriptor,
    buffer_size: usize,
    frames_per_period: usize,
    memory_locked: bool,
    state: PlayState,
    /// priming 用的一帧静音
    prime_marker: Box<[u8]>,
    stats: Arc<PlaybackStats>,
}

impl Session {
    /// 打开会话
    ///
    /// 成功返回时 player 处于 Stopped，回调已注册但不会触发，直到 [`Self::resume`]。
    pub fn open(
        backend: Arc<dyn Backend>,
        requested: AudioFormat,
        config: &OutputConfig,
        mut pipeline: Box<dyn Pipeline>,
        stats: Arc<PlaybackStats>,
    ) -> Result<Self, OutputError> {
        config.validate()?;
        if requested.sample_rate == 0 || requested.channels == 0 {
            return Err(OutputError::InvalidConfig(format!(
                "invalid requested format: {} Hz, {} channels",
                requested.sample_rate, requested.channels
            )));
        }

        let caps = backend.capabilities();
        let mut graph = BackendGraph::new(Arc::clone(&backend));

        let prepared =
            match Self::build(&*backend, &mut graph, &caps, requested, config, &mut *pipeline) {
                Ok(prepared) => prepared,
                Err(e) => {
                    graph.release();
                    return Err(e);
                }
            };

        let Prepared {
            format,
            pcm,
            buffer,
            play,
            queue,
        } = prepared;

        let buffer_size = buffer.len();
        let frames = buffer.frames();
        let memory_locked = buffer.is_memory_locked();

        let context = Arc::new(RefillContext::new(
            buffer,
            pipeline,
            Arc::clone(&backend),
            queue,
            &format,
            Arc::clone(&stats),
        ));

        let callback_context = Arc::clone(&context);
        let registered = backend.register_callback(
            queue,
            Box::new(move || {
                callback_context.run();
            }),
        );
        if let Err(e) = step(SetupStep::RegisterCallback, registered) {
            context.set_phase(Phase::Teardown);
            graph.release();
            drop(context);
            return Err(e);
        }

        context.set_phase(Phase::Running);

        log::info!(
            "{} opened: {} Hz, {} ch, {} ({} frames, {} bytes per buffer)",
            DRIVER_NAME,
            format.sample_rate,
            format.channels,
            format.sample_format,
            frames,
            buffer_size
        );

        Ok(Self {
            backend,
            caps,
            graph,
            context: Some(context),
            format,
            pcm,
            buffer_size,
            frames_per_period: frames,
            memory_locked,
            state: PlayState::Stopped,
            prime_marker: vec![0u8; format.bytes_per_frame()].into_boxed_slice(),
            stats,
        })
    }

    /// 构建后端对象图，失败时由调用方释放 `graph` 中已有的对象
    fn build(
        backend: &dyn Backend,
        graph: &mut BackendGraph,
        caps: &BackendCaps,
        requested: AudioFormat,
        config: &OutputConfig,
        pipeline: &mut dyn Pipeline,
    ) -> Result<Prepared, OutputError> {
        let engine = step(SetupStep::CreateEngine, backend.create_engine())?;
        graph.engine = Some(graph.adopt(ObjectKind::Engine, engine));
        step(SetupStep::RealizeEngine, backend.realize(engine))?;
        let engine_itf = step(
            SetupStep::GetEngineInterface,
            backend.get_interface(engine, InterfaceKind::Engine),
        )?;
        graph.engine_itf = Some(engine_itf);
        log::debug!("Engine realized");

        let mix = step(SetupStep::CreateOutputMix, backend.create_output_mix(engine_itf))?;
        graph.output_mix = Some(graph.adopt(ObjectKind::OutputMix, mix));
        step(SetupStep::RealizeOutputMix, backend.realize(mix))?;
        log::debug!("Output mix realized");

        // 采样率覆盖在协商之前生效
        let mut requested = requested;
        if let Some(rate) = config.sample_rate {
            if rate != requested.sample_rate {
                log::info!(
                    "Sample rate overridden: {} Hz → {} Hz",
                    requested.sample_rate,
                    rate
                );
            }
            requested.sample_rate = rate;
        }

        let negotiated = negotiate(&requested, &caps.formats, caps.channels)?;
        let format = negotiated.format;
        pipeline.configure(&format);

        let frames = frames_per_period(format.sample_rate, config.frames_per_buffer);
        let mut buffer =
            PeriodBuffer::allocate(frames, format.channels as usize, format.bytes_per_sample())?;
        if config.lock_memory {
            buffer.lock_memory();
        }

        let source = SourceDescriptor {
            locator: BufferQueueLocator {
                num_buffers: NUM_BUFFERS,
            },
            format: negotiated.pcm,
        };
        let sink = SinkDescriptor { output_mix: mix };
        let player = step(
            SetupStep::CreatePlayer,
            backend.create_player(engine_itf, &source, &sink, &[InterfaceKind::BufferQueue]),
        )?;
        graph.player = Some(graph.adopt(ObjectKind::Player, player));
        step(SetupStep::RealizePlayer, backend.realize(player))?;

        let play = step(
            SetupStep::GetPlayInterface,
            backend.get_interface(player, InterfaceKind::Play),
        )?;
        graph.play_itf = Some(play);
        let queue = step(
            SetupStep::GetQueueInterface,
            backend.get_interface(player, InterfaceKind::BufferQueue),
        )?;
        graph.queue_itf = Some(queue);
        log::debug!("Audio player realized");

        Ok(Prepared {
            format,
            pcm: negotiated.pcm,
            buffer,
            play,
            queue,
        })
    }

    fn live(&self) -> Result<(&Arc<RefillContext>, InterfaceId, InterfaceId), OutputError> {
        match (
            self.context.as_ref(),
            self.graph.play_interface(),
            self.graph.queue_interface(),
        ) {
            (Some(context), Some(play), Some(queue)) => Ok((context, play, queue)),
            _ => Err(OutputError::InvalidState("session closed")),
        }
    }

    /// 开始（或恢复）播放
    ///
    /// 切到 Playing 后 prime 队列一次，否则后端永远不会回调。
    /// 已在播放且队列正常时直接返回。
    pub fn resume(&mut self) -> Result<(), OutputError> {
        let (context, play, queue) = self.live()?;
        let context = Arc::clone(context);

        if self.state == PlayState::Playing && context.stall().is_none() {
            return Ok(());
        }

        self.backend
            .set_play_state(play, PlayState::Playing)
            .map_err(|source| {
                log::warn!("Failed to set play state to Playing: {}", source);
                OutputError::Transition {
                    state: PlayState::Playing,
                    source,
                }
            })?;
        self.state = PlayState::Playing;
        context.clear_stall();

        match self.caps.prime {
            PrimeMode::Marker => self.enqueue_marker(queue),
            PrimeMode::Synchronous => match context.run() {
                RefillOutcome::Submitted(_) => {}
                RefillOutcome::Failed(e) => {
                    log::warn!("Synchronous priming refill failed: {}", e);
                }
                // 回调正在执行，它提交的数据可能已被 reset 清掉
                RefillOutcome::Skipped => {
                    log::debug!("Refill in flight, priming with marker buffer");
                    self.enqueue_marker(queue);
                }
            },
        }
        self.stats.record_prime();

        log::info!("Playback started");
        Ok(())
    }

    /// 入队一帧静音，等后端回调
    fn enqueue_marker(&self, queue: InterfaceId) {
        if let Err(e) = self.backend.enqueue(queue, &self.prime_marker) {
            // 队列里还有数据时会失败，回调照样会来
            log::warn!("Priming enqueue failed: {}", e);
        }
    }

    /// 停止回调驱动的提交
    ///
    /// 按后端能力停止或暂停；buffer 和后端对象保持不变。
    pub fn reset(&mut self) -> Result<(), OutputError> {
        let (_, play, _) = self.live()?;

        let target = match self.caps.reset {
            ResetMode::Stop => PlayState::Stopped,
            ResetMode::Pause => PlayState::Paused,
        };

        self.backend.set_play_state(play, target).map_err(|source| {
            log::warn!("Failed to set play state to {:?}: {}", target, source);
            OutputError::Transition {
                state: target,
                source,
            }
        })?;
        self.state = target;

        log::info!("Playback reset ({:?})", target);
        Ok(())
    }

    /// 关闭会话，可重复调用
    pub fn close(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };

        context.set_phase(Phase::Teardown);
        // player 销毁后不会再有回调，之后才能释放 buffer
        self.graph.release();
        drop(context);

        self.state = PlayState::Stopped;
        log::info!("{} closed", DRIVER_NAME);
    }

    /// 检查回调链是否因入队失败而停转
    pub fn check_health(&self) -> Result<(), OutputError> {
        match self.context.as_ref().and_then(|c| c.stall()) {
            Some(err) => Err(OutputError::Submission(err)),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn state(&self) -> PlayState {
        self.state
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    /// 协商后的格式
    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    #[inline]
    pub fn pcm(&self) -> PcmDescriptor {
        self.pcm
    }

    /// period buffer 的字节数
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn frames_per_period(&self) -> usize {
        self.frames_per_period
    }

    #[inline]
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked
    }

    #[inline]
    pub fn capabilities(&self) -> &BackendCaps {
        &self.caps
    }

    #[inline]
    pub fn stats(&self) -> &Arc<PlaybackStats> {
        &self.stats
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::RefillCallback;
    use crate::audio::sim::{SimBackend, SimCall};
    use std::sync::mpsc;
    use std::thread;

    /// 总是返回满 buffer 的管线，持有 token 用来检查是否被释放
    struct FullPipeline {
        _token: Arc<()>,
    }

    impl Pipeline for FullPipeline {
        fn pull(&mut self, out: &mut [u8], _presentation_ns: u64) -> usize {
            out.fill(0x11);
            out.len()
        }
    }

    fn cd_format() -> AudioFormat {
        AudioFormat::new(44100, 2, SampleFormat::S16)
    }

    fn open_with(
        sim: &Arc<SimBackend>,
        config: &OutputConfig,
    ) -> (Result<Session, OutputError>, Arc<()>) {
        let token = Arc::new(());
        let pipeline = Box::new(FullPipeline {
            _token: Arc::clone(&token),
        });
        let session = Session::open(
            sim.clone(),
            cd_format(),
            config,
            pipeline,
            Arc::new(PlaybackStats::new()),
        );
        (session, token)
    }

    fn open(sim: &Arc<SimBackend>) -> (Session, Arc<()>) {
        let (session, token) = open_with(sim, &OutputConfig::default());
        (session.unwrap(), token)
    }

    fn sim_with(reset: ResetMode, prime: PrimeMode) -> Arc<SimBackend> {
        Arc::new(SimBackend::new(BackendCaps {
            reset,
            prime,
            ..BackendCaps::default()
        }))
    }

    /// 最多 tick `limit` 次，返回第一次回调发生在第几次
    fn ticks_until_callback(sim: &SimBackend, limit: usize) -> Option<usize> {
        (1..=limit).find(|_| sim.tick().callbacks > 0)
    }

    #[test]
    fn test_config_ranges() {
        assert!(OutputConfig::default().validate().is_ok());

        let ok = OutputConfig {
            frames_per_buffer: Some(10_000),
            sample_rate: Some(1_000),
            lock_memory: false,
        };
        assert!(ok.validate().is_ok());

        for config in [
            OutputConfig {
                frames_per_buffer: Some(0),
                ..Default::default()
            },
            OutputConfig {
                frames_per_buffer: Some(10_001),
                ..Default::default()
            },
            OutputConfig {
                sample_rate: Some(999),
                ..Default::default()
            },
            OutputConfig {
                sample_rate: Some(100_001),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(OutputError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_invalid_config_creates_nothing() {
        let sim = Arc::new(SimBackend::default());
        let config = OutputConfig {
            frames_per_buffer: Some(20_000),
            ..Default::default()
        };
        let (result, token) = open_with(&sim, &config);
        assert!(matches!(result, Err(OutputError::InvalidConfig(_))));
        assert_eq!(sim.objects_created(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_open_negotiates_and_sizes_buffer() {
        let sim = Arc::new(SimBackend::default());
        let (session, _token) = open(&sim);

        assert_eq!(session.format(), cd_format());
        assert_eq!(session.frames_per_period(), 2205);
        assert_eq!(session.buffer_size(), 8820);
        assert_eq!(session.pcm().samples_per_sec, 44_100_000);
        assert_eq!(session.state(), PlayState::Stopped);
        assert_eq!(sim.live_objects(), 3);
        assert!(sim.has_callback());
        // 打开后没有任何入队
        assert_eq!(sim.queued(), 0);
    }

    #[test]
    fn test_sample_rate_and_frames_override() {
        let sim = Arc::new(SimBackend::default());
        let config = OutputConfig {
            frames_per_buffer: Some(256),
            sample_rate: Some(48_000),
            lock_memory: false,
        };
        let (session, _token) = open_with(&sim, &config);
        let session = session.unwrap();
        assert_eq!(session.format().sample_rate, 48_000);
        assert_eq!(session.frames_per_period(), 256);
        assert_eq!(session.buffer_size(), 256 * 4);
    }

    #[test]
    fn test_open_close_releases_everything() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, token) = open(&sim);
        assert_eq!(Arc::strong_count(&token), 2);

        session.close();
        assert!(!session.is_open());
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(
            sim.destroyed(),
            vec![ObjectKind::Player, ObjectKind::OutputMix, ObjectKind::Engine]
        );
        // 管线和 buffer 在同一个上下文里，一起被释放
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_double_close_is_noop() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);
        session.close();
        session.close();
        drop(session);
        assert_eq!(sim.destroyed().len(), 3);
    }

    #[test]
    fn test_operations_after_close_are_invalid() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);
        session.close();
        assert!(matches!(session.resume(), Err(OutputError::InvalidState(_))));
        assert!(matches!(session.reset(), Err(OutputError::InvalidState(_))));
        assert!(session.check_health().is_ok());
    }

    #[test]
    fn test_every_setup_failure_rolls_back() {
        let cases = [
            (SimCall::CreateEngine, SetupStep::CreateEngine),
            (SimCall::Realize(ObjectKind::Engine), SetupStep::RealizeEngine),
            (
                SimCall::GetInterface(InterfaceKind::Engine),
                SetupStep::GetEngineInterface,
            ),
            (SimCall::CreateOutputMix, SetupStep::CreateOutputMix),
            (
                SimCall::Realize(ObjectKind::OutputMix),
                SetupStep::RealizeOutputMix,
            ),
            (SimCall::CreatePlayer, SetupStep::CreatePlayer),
            (SimCall::Realize(ObjectKind::Player), SetupStep::RealizePlayer),
            (
                SimCall::GetInterface(InterfaceKind::Play),
                SetupStep::GetPlayInterface,
            ),
            (
                SimCall::GetInterface(InterfaceKind::BufferQueue),
                SetupStep::GetQueueInterface,
            ),
            (SimCall::RegisterCallback, SetupStep::RegisterCallback),
        ];

        for (call, expected) in cases {
            let sim = Arc::new(SimBackend::default());
            sim.fail_on(call, BackendError::ResourceError);

            let (result, token) = open_with(&sim, &OutputConfig::default());
            match result {
                Err(OutputError::Setup { step, source }) => {
                    assert_eq!(step, expected);
                    assert_eq!(source, BackendError::ResourceError);
                }
                Err(e) => panic!("{:?}: unexpected error {}", call, e),
                Ok(_) => panic!("{:?}: open should fail", call),
            }

            assert_eq!(sim.live_objects(), 0, "{:?} leaked objects", call);
            assert_eq!(
                sim.destroyed().len() as u64,
                sim.objects_created(),
                "{:?}",
                call
            );
            assert!(!sim.has_callback());
            assert_eq!(Arc::strong_count(&token), 1);
        }
    }

    #[test]
    fn test_rollback_is_reverse_order() {
        let sim = Arc::new(SimBackend::default());
        sim.fail_on(
            SimCall::GetInterface(InterfaceKind::BufferQueue),
            BackendError::FeatureUnsupported,
        );
        let (result, _token) = open_with(&sim, &OutputConfig::default());
        assert!(result.is_err());
        assert_eq!(
            sim.destroyed(),
            vec![ObjectKind::Player, ObjectKind::OutputMix, ObjectKind::Engine]
        );
    }

    #[test]
    fn test_unsupported_format_stops_before_player() {
        let sim = Arc::new(SimBackend::new(BackendCaps {
            formats: Vec::new(),
            ..BackendCaps::default()
        }));
        let (result, token) = open_with(&sim, &OutputConfig::default());
        assert!(matches!(
            result,
            Err(OutputError::UnsupportedFormat(SampleFormat::S16))
        ));
        // 只创建了 engine 和 output mix
        assert_eq!(sim.objects_created(), 2);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_refills_submit_full_buffers() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);
        session.resume().unwrap();
        assert_eq!(session.state(), PlayState::Playing);

        // 第一次 tick 播放的是 priming 标记
        const N: usize = 8;
        for _ in 0..=N {
            assert_eq!(sim.tick().callbacks, 1);
        }

        let played = sim.played();
        assert_eq!(played[0], 4);
        assert_eq!(played[1..], [8820; N]);

        let stats = session.stats();
        assert_eq!(stats.refill_count(), N as u64 + 1);
        assert_eq!(stats.submission_count(), N as u64 + 1);
        assert_eq!(stats.prime_count(), 1);
        assert!(stats.last_presentation_ns() > 0);
        assert!(session.check_health().is_ok());
    }

    #[test]
    fn test_resume_after_stop_reset_retriggers() {
        let sim = sim_with(ResetMode::Stop, PrimeMode::Marker);
        let (mut session, _token) = open(&sim);

        session.resume().unwrap();
        assert_eq!(ticks_until_callback(&sim, 3), Some(1));

        session.reset().unwrap();
        assert_eq!(session.state(), PlayState::Stopped);
        assert_eq!(sim.queued(), 0);
        assert_eq!(ticks_until_callback(&sim, 3), None);

        session.resume().unwrap();
        assert!(ticks_until_callback(&sim, 3).is_some());
        assert_eq!(session.stats().prime_count(), 2);
    }

    #[test]
    fn test_resume_after_pause_reset_retriggers() {
        let sim = sim_with(ResetMode::Pause, PrimeMode::Marker);
        let (mut session, _token) = open(&sim);

        session.resume().unwrap();
        sim.tick();
        session.reset().unwrap();
        assert_eq!(session.state(), PlayState::Paused);
        // 暂停时队列保留
        assert_eq!(sim.queued(), 1);
        assert_eq!(ticks_until_callback(&sim, 3), None);

        // 队列满，priming 入队失败但不影响恢复
        session.resume().unwrap();
        assert!(ticks_until_callback(&sim, 3).is_some());
        assert!(session.check_health().is_ok());
    }

    #[test]
    fn test_synchronous_prime_submits_full_buffer() {
        let sim = sim_with(ResetMode::Stop, PrimeMode::Synchronous);
        let (mut session, _token) = open(&sim);

        session.resume().unwrap();
        assert_eq!(sim.queued(), 1);
        assert_eq!(session.stats().bytes_submitted(), 8820);

        assert_eq!(ticks_until_callback(&sim, 3), Some(1));
        assert_eq!(sim.played(), vec![8820]);

        session.reset().unwrap();
        session.resume().unwrap();
        assert!(ticks_until_callback(&sim, 3).is_some());
    }

    /// 包装模拟后端：armed 之后的第一次入队会停住，直到测试放行
    struct GatedBackend {
        inner: Arc<SimBackend>,
        entered: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
        release: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl GatedBackend {
        fn new(inner: Arc<SimBackend>) -> Self {
            Self {
                inner,
                entered: parking_lot::Mutex::new(None),
                release: parking_lot::Mutex::new(None),
            }
        }

        /// 返回 (入队已停住的通知, 放行开关)
        fn arm(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.entered.lock() = Some(entered_tx);
            *self.release.lock() = Some(release_rx);
            (entered_rx, release_tx)
        }
    }

    impl Backend for GatedBackend {
        fn capabilities(&self) -> BackendCaps {
            self.inner.capabilities()
        }
        fn create_engine(&self) -> Result<ObjectId, BackendError> {
            self.inner.create_engine()
        }
        fn realize(&self, object: ObjectId) -> Result<(), BackendError> {
            self.inner.realize(object)
        }
        fn get_interface(
            &self,
            object: ObjectId,
            kind: InterfaceKind,
        ) -> Result<InterfaceId, BackendError> {
            self.inner.get_interface(object, kind)
        }
        fn create_output_mix(&self, engine: InterfaceId) -> Result<ObjectId, BackendError> {
            self.inner.create_output_mix(engine)
        }
        fn create_player(
            &self,
            engine: InterfaceId,
            source: &SourceDescriptor,
            sink: &SinkDescriptor,
            required: &[InterfaceKind],
        ) -> Result<ObjectId, BackendError> {
            self.inner.create_player(engine, source, sink, required)
        }
        fn destroy(&self, object: ObjectId) {
            self.inner.destroy(object)
        }
        fn enqueue(&self, queue: InterfaceId, data: &[u8]) -> Result<(), BackendError> {
            let entered = self.entered.lock().take();
            if let Some(entered) = entered {
                let release = self.release.lock().take();
                let _ = entered.send(());
                if let Some(release) = release {
                    let _ = release.recv();
                }
            }
            self.inner.enqueue(queue, data)
        }
        fn register_callback(
            &self,
            queue: InterfaceId,
            callback: RefillCallback,
        ) -> Result<(), BackendError> {
            self.inner.register_callback(queue, callback)
        }
        fn set_play_state(&self, play: InterfaceId, state: PlayState) -> Result<(), BackendError> {
            self.inner.set_play_state(play, state)
        }
    }

    #[test]
    fn test_synchronous_prime_with_callback_in_flight() {
        let sim = sim_with(ResetMode::Stop, PrimeMode::Synchronous);
        let gated = Arc::new(GatedBackend::new(Arc::clone(&sim)));
        let token = Arc::new(());
        let mut session = Session::open(
            gated.clone(),
            cd_format(),
            &OutputConfig::default(),
            Box::new(FullPipeline {
                _token: Arc::clone(&token),
            }),
            Arc::new(PlaybackStats::new()),
        )
        .unwrap();
        session.resume().unwrap();
        assert_eq!(sim.queued(), 1);

        // 回调停在入队之前，busy 标记仍被占用
        let (entered, release) = gated.arm();
        let ticker = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || sim.tick())
        };
        entered.recv().unwrap();

        session.reset().unwrap();
        session.resume().unwrap();
        assert_eq!(session.state(), PlayState::Playing);
        assert_eq!(sim.queued(), 1);

        // 放行后回调的入队因队列已满而失败
        release.send(()).unwrap();
        assert_eq!(ticker.join().unwrap().callbacks, 1);
        let refills = session.stats().refill_count();

        assert!(ticks_until_callback(&sim, 3).is_some());
        assert!(session.stats().refill_count() > refills);
        assert_eq!(sim.queued(), 1);
        assert!(session.check_health().is_ok());

        session.close();
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_resume_while_playing_is_noop() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);
        session.resume().unwrap();
        session.resume().unwrap();
        assert_eq!(session.stats().prime_count(), 1);
        assert_eq!(sim.queued(), 1);
    }

    #[test]
    fn test_transition_failure_is_not_fatal() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);

        sim.fail_on(SimCall::SetPlayState, BackendError::ResourceLost);
        match session.resume() {
            Err(OutputError::Transition { state, source }) => {
                assert_eq!(state, PlayState::Playing);
                assert_eq!(source, BackendError::ResourceLost);
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
        assert_eq!(session.state(), PlayState::Stopped);
        assert!(session.is_open());

        sim.clear_failures();
        session.resume().unwrap();
        assert_eq!(session.state(), PlayState::Playing);
        assert!(ticks_until_callback(&sim, 3).is_some());
    }

    #[test]
    fn test_submission_failure_surfaces_as_stall() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, _token) = open(&sim);
        session.resume().unwrap();

        sim.fail_on(SimCall::Enqueue, BackendError::BufferInsufficient);
        assert_eq!(sim.tick().callbacks, 1);
        assert!(matches!(
            session.check_health(),
            Err(OutputError::Submission(BackendError::BufferInsufficient))
        ));
        assert_eq!(session.stats().submission_error_count(), 1);

        // 没有 buffer 在队列里，回调链已断
        assert_eq!(ticks_until_callback(&sim, 3), None);

        sim.clear_failures();
        session.resume().unwrap();
        assert!(session.check_health().is_ok());
        assert!(ticks_until_callback(&sim, 3).is_some());
    }

    #[test]
    fn test_close_while_playing() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, token) = open(&sim);
        session.resume().unwrap();
        sim.tick();
        sim.tick();

        session.close();
        assert_eq!(sim.live_objects(), 0);
        assert!(!sim.has_callback());
        assert_eq!(sim.tick().callbacks, 0);
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_close_with_clock_running() {
        let sim = Arc::new(SimBackend::default());
        let (mut session, token) = open(&sim);
        let mut clock = sim.start_clock();
        session.resume().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(120));

        session.close();
        clock.stop();
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(Arc::strong_count(&token), 1);
        assert!(sim.callbacks_fired() >= 1);
    }

    #[test]
    fn test_stereo_only_pins_channels_for_pipeline() {
        let sim = Arc::new(SimBackend::default());
        let token = Arc::new(());
        let session = Session::open(
            sim.clone(),
            AudioFormat::new(48000, 6, SampleFormat::Float),
            &OutputConfig::default(),
            Box::new(FullPipeline { _token: token }),
            Arc::new(PlaybackStats::new()),
        )
        .unwrap();
        assert_eq!(
            session.format(),
            AudioFormat::new(48000, 2, SampleFormat::S16)
        );
        assert_eq!(session.buffer_size(), 2400 * 4);
    }
}
