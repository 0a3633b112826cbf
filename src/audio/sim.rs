//! 进程内模拟后端
//!
//! 按 OpenSL ES 的对象模型实现 [`Backend`]：
//! - 对象必须 realize 之后才能获取接口
//! - buffer queue 容量由数据源定位器的 `num_buffers` 决定，满了返回 `BufferInsufficient`
//! - 切到 Stopped 时清空队列，Paused 保留
//! - 每次 `tick()` 视为队首 buffer 播放完毕，随后调用已注册的回调
//!
//! 同时记录对象的创建/销毁，用来检查 teardown 是否完整。
//! CLI 使用 [`SimBackend::start_clock`] 在独立线程上按实时节奏驱动。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::backend::{
    Backend, BackendCaps, BackendError, InterfaceId, InterfaceKind, ObjectId, ObjectKind,
    PlayState, RefillCallback, SinkDescriptor, SourceDescriptor,
};
use super::format::{backend_code, ChannelPolicy, PcmDescriptor};

/// 可注入失败的调用点
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimCall {
    CreateEngine,
    Realize(ObjectKind),
    GetInterface(InterfaceKind),
    CreateOutputMix,
    CreatePlayer,
    RegisterCallback,
    Enqueue,
    SetPlayState,
}

/// 没有 buffer 播放时时钟线程的轮询间隔
const IDLE_TICK: Duration = Duration::from_millis(5);

struct PlayerState {
    format: PcmDescriptor,
    capacity: usize,
    state: PlayState,
    queue: VecDeque<Vec<u8>>,
    callback: Option<RefillCallback>,
    in_callback: bool,
}

impl PlayerState {
    fn bytes_per_second(&self) -> u64 {
        let bytes_per_frame = self.format.channels as u64 * self.format.container_size as u64 / 8;
        bytes_per_frame * self.format.samples_per_sec as u64 / 1000
    }
}

struct SimObject {
    kind: ObjectKind,
    realized: bool,
    player: Option<PlayerState>,
}

#[derive(Default)]
struct SimState {
    next_id: u32,
    objects: HashMap<ObjectId, SimObject>,
    interfaces: HashMap<InterfaceId, (ObjectId, InterfaceKind)>,
    failures: HashMap<SimCall, BackendError>,
    created: u64,
    destroyed: Vec<ObjectKind>,
    played: Vec<usize>,
    callbacks_fired: u64,
}

impl SimState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, call: SimCall) -> Result<(), BackendError> {
        match self.failures.get(&call) {
            Some(&err) => Err(err),
            None => Ok(()),
        }
    }

    fn add_object(&mut self, kind: ObjectKind, player: Option<PlayerState>) -> ObjectId {
        let id = ObjectId(self.next_id());
        self.objects.insert(
            id,
            SimObject {
                kind,
                realized: false,
                player,
            },
        );
        self.created += 1;
        id
    }

    fn interface(
        &self,
        id: InterfaceId,
        kind: InterfaceKind,
    ) -> Result<ObjectId, BackendError> {
        match self.interfaces.get(&id) {
            Some(&(object, k)) if k == kind => Ok(object),
            _ => Err(BackendError::ParameterInvalid),
        }
    }

    fn player_mut(
        &mut self,
        id: InterfaceId,
        kind: InterfaceKind,
    ) -> Result<&mut PlayerState, BackendError> {
        let object = self.interface(id, kind)?;
        self.objects
            .get_mut(&object)
            .and_then(|o| o.player.as_mut())
            .ok_or(BackendError::ParameterInvalid)
    }
}

/// 一次 tick 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tick {
    /// 触发的回调次数
    pub callbacks: usize,
    /// 本次播放完毕的音频时长
    pub played: Duration,
}

/// 模拟后端
pub struct SimBackend {
    caps: BackendCaps,
    state: Mutex<SimState>,
    /// 回调结束时通知（destroy 等待正在执行的回调）
    callback_done: Condvar,
}

impl SimBackend {
    pub fn new(caps: BackendCaps) -> Self {
        Self {
            caps,
            state: Mutex::new(SimState::default()),
            callback_done: Condvar::new(),
        }
    }

    /// 让指定调用持续失败，直到 [`Self::clear_failures`]
    pub fn fail_on(&self, call: SimCall, err: BackendError) {
        self.state.lock().failures.insert(call, err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// 当前存活的对象数
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// 累计创建的对象数
    pub fn objects_created(&self) -> u64 {
        self.state.lock().created
    }

    /// 按销毁顺序排列的对象类型
    pub fn destroyed(&self) -> Vec<ObjectKind> {
        self.state.lock().destroyed.clone()
    }

    /// 已播放完毕的 buffer 长度（字节）
    pub fn played(&self) -> Vec<usize> {
        self.state.lock().played.clone()
    }

    pub fn callbacks_fired(&self) -> u64 {
        self.state.lock().callbacks_fired
    }

    /// 第一个 player 的播放状态
    pub fn player_state(&self) -> Option<PlayState> {
        let state = self.state.lock();
        state
            .objects
            .values()
            .find_map(|o| o.player.as_ref().map(|p| p.state))
    }

    /// 所有 player 队列中的 buffer 数
    pub fn queued(&self) -> usize {
        let state = self.state.lock();
        state
            .objects
            .values()
            .filter_map(|o| o.player.as_ref())
            .map(|p| p.queue.len())
            .sum()
    }

    /// 是否有已注册的回调
    pub fn has_callback(&self) -> bool {
        let state = self.state.lock();
        state
            .objects
            .values()
            .filter_map(|o| o.player.as_ref())
            .any(|p| p.callback.is_some() || p.in_callback)
    }

    /// 推进一个播放周期
    ///
    /// 每个处于 Playing 且队列非空的 player 播放完队首 buffer，然后调用回调。
    /// 回调在不持锁的情况下执行，可以重新入队。
    pub fn tick(&self) -> Tick {
        let mut tick = Tick::default();

        let players: Vec<ObjectId> = {
            let state = self.state.lock();
            state
                .objects
                .iter()
                .filter(|(_, o)| o.player.is_some())
                .map(|(&id, _)| id)
                .collect()
        };

        for id in players {
            let callback = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let Some(player) = state.objects.get_mut(&id).and_then(|o| o.player.as_mut())
                else {
                    continue;
                };
                if player.state != PlayState::Playing {
                    continue;
                }
                let Some(buffer) = player.queue.pop_front() else {
                    continue;
                };

                let bps = player.bytes_per_second();
                if bps > 0 {
                    tick.played += Duration::from_nanos(
                        buffer.len() as u64 * 1_000_000_000 / bps,
                    );
                }
                let callback = player.callback.take();
                if callback.is_some() {
                    player.in_callback = true;
                }
                state.played.push(buffer.len());
                callback
            };

            let Some(mut callback) = callback else {
                continue;
            };
            callback();

            let mut state = self.state.lock();
            state.callbacks_fired += 1;
            if let Some(player) = state.objects.get_mut(&id).and_then(|o| o.player.as_mut()) {
                if player.callback.is_none() {
                    player.callback = Some(callback);
                }
                player.in_callback = false;
            }
            drop(state);
            self.callback_done.notify_all();
            tick.callbacks += 1;
        }

        tick
    }

    /// 在后台线程上按实时节奏驱动 tick
    pub fn start_clock(self: &Arc<Self>) -> SimClock {
        let running = Arc::new(AtomicBool::new(true));
        let backend = Arc::clone(self);
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("sim-audio".to_string())
            .spawn(move || {
                log::debug!("Simulated audio clock started");
                while flag.load(Ordering::Acquire) {
                    let tick = backend.tick();
                    let sleep = if tick.played.is_zero() {
                        IDLE_TICK
                    } else {
                        tick.played
                    };
                    thread::sleep(sleep);
                }
                log::debug!("Simulated audio clock stopped");
            });

        match handle {
            Ok(handle) => SimClock {
                running,
                handle: Some(handle),
            },
            Err(e) => {
                log::error!("Failed to spawn simulated audio clock: {}", e);
                SimClock {
                    running,
                    handle: None,
                }
            }
        }
    }

    fn format_supported(&self, format: &PcmDescriptor) -> bool {
        let bits_ok = self
            .caps
            .formats
            .iter()
            .any(|&f| backend_code(f) == Some(format.bits_per_sample));
        let channels_ok = match self.caps.channels {
            ChannelPolicy::StereoOnly => format.channels == 2,
            ChannelPolicy::Native { max_channels } => {
                format.channels >= 1 && format.channels <= max_channels as u32
            }
        };
        bits_ok && channels_ok && format.samples_per_sec > 0
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(BackendCaps::default())
    }
}

impl Backend for SimBackend {
    fn capabilities(&self) -> BackendCaps {
        self.caps.clone()
    }

    fn create_engine(&self) -> Result<ObjectId, BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::CreateEngine)?;
        Ok(state.add_object(ObjectKind::Engine, None))
    }

    fn realize(&self, object: ObjectId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let kind = state
            .objects
            .get(&object)
            .map(|o| o.kind)
            .ok_or(BackendError::ParameterInvalid)?;
        state.check(SimCall::Realize(kind))?;

        let obj = state
            .objects
            .get_mut(&object)
            .ok_or(BackendError::ParameterInvalid)?;
        if obj.realized {
            return Err(BackendError::PreconditionsViolated);
        }
        obj.realized = true;
        Ok(())
    }

    fn get_interface(
        &self,
        object: ObjectId,
        kind: InterfaceKind,
    ) -> Result<InterfaceId, BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::GetInterface(kind))?;

        let obj = state
            .objects
            .get(&object)
            .ok_or(BackendError::ParameterInvalid)?;
        if !obj.realized {
            return Err(BackendError::PreconditionsViolated);
        }
        let exposed = matches!(
            (obj.kind, kind),
            (ObjectKind::Engine, InterfaceKind::Engine)
                | (ObjectKind::Player, InterfaceKind::Play)
                | (ObjectKind::Player, InterfaceKind::BufferQueue)
        );
        if !exposed {
            return Err(BackendError::FeatureUnsupported);
        }

        let id = InterfaceId(state.next_id());
        state.interfaces.insert(id, (object, kind));
        Ok(id)
    }

    fn create_output_mix(&self, engine: InterfaceId) -> Result<ObjectId, BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::CreateOutputMix)?;
        state.interface(engine, InterfaceKind::Engine)?;
        Ok(state.add_object(ObjectKind::OutputMix, None))
    }

    fn create_player(
        &self,
        engine: InterfaceId,
        source: &SourceDescriptor,
        sink: &SinkDescriptor,
        required: &[InterfaceKind],
    ) -> Result<ObjectId, BackendError> {
        if !self.format_supported(&source.format) {
            return Err(BackendError::ContentUnsupported);
        }
        if source.locator.num_buffers == 0 || !required.contains(&InterfaceKind::BufferQueue) {
            return Err(BackendError::ParameterInvalid);
        }

        let mut state = self.state.lock();
        state.check(SimCall::CreatePlayer)?;
        state.interface(engine, InterfaceKind::Engine)?;
        match state.objects.get(&sink.output_mix) {
            Some(o) if o.kind == ObjectKind::OutputMix && o.realized => {}
            _ => return Err(BackendError::ParameterInvalid),
        }

        let player = PlayerState {
            format: source.format,
            capacity: source.locator.num_buffers as usize,
            state: PlayState::Stopped,
            queue: VecDeque::new(),
            callback: None,
            in_callback: false,
        };
        Ok(state.add_object(ObjectKind::Player, Some(player)))
    }

    fn destroy(&self, object: ObjectId) {
        let mut state = self.state.lock();

        // 等待正在执行的回调返回
        while state
            .objects
            .get(&object)
            .and_then(|o| o.player.as_ref())
            .is_some_and(|p| p.in_callback)
        {
            self.callback_done.wait(&mut state);
        }

        let Some(obj) = state.objects.remove(&object) else {
            log::warn!("destroy: unknown object {:?}", object);
            return;
        };
        state.interfaces.retain(|_, (o, _)| *o != object);
        state.destroyed.push(obj.kind);

        let still_alive = state.objects.len();
        drop(state);

        if obj.kind == ObjectKind::Engine && still_alive > 0 {
            log::warn!("Engine destroyed while {} objects are alive", still_alive);
        }
        // 回调（及其捕获的上下文）在锁外释放
        drop(obj);
    }

    fn enqueue(&self, queue: InterfaceId, data: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::Enqueue)?;
        let player = state.player_mut(queue, InterfaceKind::BufferQueue)?;
        if data.is_empty() {
            return Err(BackendError::ParameterInvalid);
        }
        if player.queue.len() >= player.capacity {
            return Err(BackendError::BufferInsufficient);
        }
        player.queue.push_back(data.to_vec());
        Ok(())
    }

    fn register_callback(
        &self,
        queue: InterfaceId,
        callback: RefillCallback,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::RegisterCallback)?;
        let player = state.player_mut(queue, InterfaceKind::BufferQueue)?;
        if player.state != PlayState::Stopped {
            return Err(BackendError::PreconditionsViolated);
        }
        player.callback = Some(callback);
        Ok(())
    }

    fn set_play_state(&self, play: InterfaceId, new_state: PlayState) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check(SimCall::SetPlayState)?;
        let player = state.player_mut(play, InterfaceKind::Play)?;
        player.state = new_state;
        if new_state == PlayState::Stopped {
            player.queue.clear();
        }
        Ok(())
    }
}

/// 模拟时钟线程句柄，Drop 时停止并等待线程退出
pub struct SimClock {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimClock {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::BufferQueueLocator;
    use crate::audio::format::{ByteOrder, SPEAKER_FRONT_LEFT, SPEAKER_FRONT_RIGHT};

    fn stereo_s16() -> PcmDescriptor {
        PcmDescriptor {
            channels: 2,
            samples_per_sec: 44_100_000,
            bits_per_sample: 16,
            container_size: 16,
            channel_mask: SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT,
            endianness: ByteOrder::Little,
        }
    }

    /// engine → output mix → player，返回 (player, play, queue)
    fn build(sim: &SimBackend) -> (ObjectId, InterfaceId, InterfaceId) {
        let engine = sim.create_engine().unwrap();
        sim.realize(engine).unwrap();
        let engine_itf = sim.get_interface(engine, InterfaceKind::Engine).unwrap();
        let mix = sim.create_output_mix(engine_itf).unwrap();
        sim.realize(mix).unwrap();
        let source = SourceDescriptor {
            locator: BufferQueueLocator { num_buffers: 1 },
            format: stereo_s16(),
        };
        let player = sim
            .create_player(
                engine_itf,
                &source,
                &SinkDescriptor { output_mix: mix },
                &[InterfaceKind::BufferQueue],
            )
            .unwrap();
        sim.realize(player).unwrap();
        let play = sim.get_interface(player, InterfaceKind::Play).unwrap();
        let queue = sim.get_interface(player, InterfaceKind::BufferQueue).unwrap();
        (player, play, queue)
    }

    #[test]
    fn test_interface_requires_realize() {
        let sim = SimBackend::default();
        let engine = sim.create_engine().unwrap();
        assert_eq!(
            sim.get_interface(engine, InterfaceKind::Engine),
            Err(BackendError::PreconditionsViolated)
        );
        sim.realize(engine).unwrap();
        assert!(sim.get_interface(engine, InterfaceKind::Engine).is_ok());
        assert_eq!(
            sim.get_interface(engine, InterfaceKind::Play),
            Err(BackendError::FeatureUnsupported)
        );
    }

    #[test]
    fn test_queue_capacity_and_stop_clears() {
        let sim = SimBackend::default();
        let (_, play, queue) = build(&sim);

        sim.enqueue(queue, &[0; 4]).unwrap();
        assert_eq!(
            sim.enqueue(queue, &[0; 4]),
            Err(BackendError::BufferInsufficient)
        );

        sim.set_play_state(play, PlayState::Paused).unwrap();
        assert_eq!(sim.queued(), 1);
        sim.set_play_state(play, PlayState::Stopped).unwrap();
        assert_eq!(sim.queued(), 0);
    }

    #[test]
    fn test_tick_plays_and_fires_callback() {
        let sim = Arc::new(SimBackend::default());
        let (_, play, queue) = build(&sim);

        let weak = Arc::downgrade(&sim);
        sim.register_callback(
            queue,
            Box::new(move || {
                if let Some(sim) = weak.upgrade() {
                    let _ = sim.enqueue(queue, &[0; 8]);
                }
            }),
        )
        .unwrap();

        // 未 Playing 时不推进
        sim.enqueue(queue, &[0; 4]).unwrap();
        assert_eq!(sim.tick().callbacks, 0);

        sim.set_play_state(play, PlayState::Playing).unwrap();
        let tick = sim.tick();
        assert_eq!(tick.callbacks, 1);
        assert_eq!(tick.played, Duration::from_nanos(4 * 1_000_000_000 / 176_400));
        assert_eq!(sim.tick().callbacks, 1);
        assert_eq!(sim.played(), vec![4, 8]);
        assert_eq!(sim.callbacks_fired(), 2);
    }

    #[test]
    fn test_destroy_drops_callback_and_records_order() {
        let sim = SimBackend::default();
        let (player, _, queue) = build(&sim);

        let token = Arc::new(());
        let held = Arc::clone(&token);
        sim.register_callback(queue, Box::new(move || {
            let _ = &held;
        }))
        .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);

        sim.destroy(player);
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(sim.destroyed(), vec![ObjectKind::Player]);
        assert_eq!(sim.enqueue(queue, &[0; 4]), Err(BackendError::ParameterInvalid));
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let sim = SimBackend::default();
        let engine = sim.create_engine().unwrap();
        sim.realize(engine).unwrap();
        let engine_itf = sim.get_interface(engine, InterfaceKind::Engine).unwrap();
        let mix = sim.create_output_mix(engine_itf).unwrap();
        sim.realize(mix).unwrap();

        let mut format = stereo_s16();
        format.channels = 6;
        let source = SourceDescriptor {
            locator: BufferQueueLocator { num_buffers: 1 },
            format,
        };
        assert_eq!(
            sim.create_player(
                engine_itf,
                &source,
                &SinkDescriptor { output_mix: mix },
                &[InterfaceKind::BufferQueue]
            ),
            Err(BackendError::ContentUnsupported)
        );
    }
}
