//! 播放引擎
//!
//! 把管线（测试音或文件解码）接到输出会话上，并驱动模拟后端的时钟。
//! 数据流：管线 ← refill 回调 ← 后端时钟线程；控制线程只做状态切换。

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::audio::backend::BackendCaps;
use crate::audio::sim::{SimBackend, SimClock};
use crate::audio::{
    AudioFormat, Backend, OutputConfig, OutputError, Pipeline, PipelineStatus, PlayState,
    PlaybackStats, Session, StatsReport, ToneGenerator,
};
use crate::decode::{AudioDecoder, AudioInfo, DecodeError, DecoderPipeline};

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 引擎配置
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub output: OutputConfig,
    /// 模拟后端的能力
    pub backend: BackendCaps,
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("output error: {0}")]
    Output(#[from] OutputError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 播放引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// 管线已产出的时长（秒）
    pub position_secs: f64,
    pub refills: u64,
    pub underruns: u64,
    pub submission_errors: u64,
}

/// 播放引擎
pub struct Engine {
    config: EngineConfig,
    backend: Arc<SimBackend>,
    clock: Option<SimClock>,
    session: Option<Session>,
    stats: Arc<PlaybackStats>,
    status: Option<Arc<PipelineStatus>>,
    state: PlaybackState,
    current_info: Option<AudioInfo>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let backend = Arc::new(SimBackend::new(config.backend.clone()));
        Self {
            config,
            backend,
            clock: None,
            session: None,
            stats: Arc::new(PlaybackStats::new()),
            status: None,
            state: PlaybackState::Stopped,
            current_info: None,
        }
    }

    /// 加载并播放文件
    pub fn play<P: AsRef<Path>>(&mut self, path: P) -> Result<(), EngineError> {
        let path = path.as_ref();
        log::info!("Loading: {}", path.display());

        let decoder = AudioDecoder::open(path)?;
        let info = decoder.info().clone();
        log::info!(
            "Format: {} | Codec: {} | {}Hz {}ch {} | Duration: {:.1}s",
            info.format,
            info.codec,
            info.sample_rate,
            info.channels,
            info.native_format,
            info.duration_secs.unwrap_or(0.0)
        );

        let pipeline = DecoderPipeline::new(decoder);
        let status = pipeline.status();
        self.start(info.requested_format(), Box::new(pipeline), status)?;
        self.current_info = Some(info);
        Ok(())
    }

    /// 播放正弦测试音
    pub fn play_tone(
        &mut self,
        frequency: f64,
        duration_secs: Option<f64>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), EngineError> {
        log::info!(
            "Tone: {:.1} Hz, {}",
            frequency,
            duration_secs
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_else(|| "until stopped".to_string())
        );

        let tone = ToneGenerator::new(frequency, 0.5, duration_secs);
        let status = tone.status();
        self.start(
            ToneGenerator::requested_format(sample_rate, channels),
            Box::new(tone),
            status,
        )
    }

    fn start(
        &mut self,
        requested: AudioFormat,
        pipeline: Box<dyn Pipeline>,
        status: Arc<PipelineStatus>,
    ) -> Result<(), EngineError> {
        if self.state != PlaybackState::Stopped {
            self.stop();
        }

        self.stats.reset();
        let backend: Arc<dyn Backend> = self.backend.clone();
        let mut session = Session::open(
            backend,
            requested,
            &self.config.output,
            pipeline,
            Arc::clone(&self.stats),
        )?;

        if self.clock.is_none() {
            self.clock = Some(self.backend.start_clock());
        }
        session.resume()?;

        self.session = Some(session);
        self.status = Some(status);
        self.current_info = None;
        self.state = PlaybackState::Playing;
        Ok(())
    }

    /// 停止播放并关闭会话
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }

        self.state = PlaybackState::Stopped;
        self.status = None;
        self.current_info = None;
        log::info!("Playback stopped");
    }

    /// 暂停/恢复
    pub fn toggle_pause(&mut self) -> Result<(), EngineError> {
        let session = self
            .session
            .as_mut()
            .ok_or(EngineError::InvalidState("Cannot pause when stopped"))?;

        match self.state {
            PlaybackState::Playing => {
                session.reset()?;
                self.state = PlaybackState::Paused;
                log::info!("Paused");
            }
            PlaybackState::Paused => {
                session.resume()?;
                self.state = PlaybackState::Playing;
                log::info!("Resumed");
            }
            PlaybackState::Stopped => {
                return Err(EngineError::InvalidState("Cannot pause when stopped"));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// 后端播放状态
    pub fn output_state(&self) -> Option<PlayState> {
        self.session.as_ref().map(|s| s.state())
    }

    /// 检查队列是否停转
    pub fn check_health(&self) -> Result<(), EngineError> {
        match self.session {
            Some(ref session) => Ok(session.check_health()?),
            None => Ok(()),
        }
    }

    /// 管线已耗尽（最后一个 buffer 可能仍在队列中）
    pub fn is_finished(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> EngineStats {
        let sample_rate = self
            .session
            .as_ref()
            .map(|s| s.format().sample_rate)
            .unwrap_or(48000);
        let frames = self.status.as_ref().map(|s| s.frames()).unwrap_or(0);

        EngineStats {
            position_secs: frames as f64 / sample_rate as f64,
            refills: self.stats.refill_count(),
            underruns: self.stats.underrun_count(),
            submission_errors: self.stats.submission_error_count(),
        }
    }

    /// 完整统计报告
    pub fn report(&self) -> StatsReport {
        let bytes_per_second = self
            .session
            .as_ref()
            .map(|s| s.format().bytes_per_second())
            .unwrap_or(0);
        self.stats.report(bytes_per_second)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn current_info(&self) -> Option<&AudioInfo> {
        self.current_info.as_ref()
    }

    pub fn backend(&self) -> &Arc<SimBackend> {
        &self.backend
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_tone_plays_to_completion() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.play_tone(440.0, Some(0.2), 8000, 2).unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert_eq!(engine.output_state(), Some(PlayState::Playing));

        assert!(wait_until(Duration::from_secs(5), || engine.is_finished()));
        assert!(engine.check_health().is_ok());

        let stats = engine.stats();
        assert!((stats.position_secs - 0.2).abs() < 1e-9);
        assert!(stats.refills >= 4);

        let report = engine.report();
        assert!(report.seconds_submitted >= 0.2);

        engine.stop();
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.backend().live_objects(), 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.play_tone(440.0, None, 8000, 2).unwrap();

        engine.toggle_pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_eq!(engine.output_state(), Some(PlayState::Stopped));

        // 等待可能正在执行的回调结束
        thread::sleep(Duration::from_millis(20));
        let refills = engine.stats().refills;
        thread::sleep(Duration::from_millis(150));
        assert_eq!(engine.stats().refills, refills);

        engine.toggle_pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert!(wait_until(Duration::from_secs(2), || {
            engine.stats().refills > refills
        }));
    }

    #[test]
    fn test_toggle_pause_when_stopped() {
        let mut engine = Engine::new(EngineConfig::default());
        assert!(matches!(
            engine.toggle_pause(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_restart_replaces_session() {
        let mut engine = Engine::new(EngineConfig::default());
        engine.play_tone(440.0, None, 8000, 2).unwrap();
        engine.play_tone(880.0, None, 16000, 2).unwrap();
        assert_eq!(engine.backend().live_objects(), 3);
        assert_eq!(
            engine.session().map(|s| s.format().sample_rate),
            Some(16000)
        );
        engine.stop();
        assert_eq!(engine.backend().live_objects(), 0);
    }

    #[test]
    fn test_invalid_config_reported() {
        let config = EngineConfig {
            output: OutputConfig {
                frames_per_buffer: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut engine = Engine::new(config);
        assert!(matches!(
            engine.play_tone(440.0, Some(0.1), 8000, 2),
            Err(EngineError::Output(OutputError::InvalidConfig(_)))
        ));
        assert_eq!(engine.state(), PlaybackState::Stopped);
    }
}
