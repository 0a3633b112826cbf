//! 正弦测试音管线

use std::f64::consts::TAU;
use std::sync::Arc;

use super::format::{AudioFormat, SampleFormat};
use super::refill::{Pipeline, PipelineStatus};

/// 正弦波发生器
///
/// 所有声道输出同一信号，按协商后的格式打包。
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
    duration_secs: Option<f64>,
    format: Option<AudioFormat>,
    remaining: Option<u64>,
    phase: f64,
    step: f64,
    /// 一帧的样本（左对齐 i32）
    frame: Vec<i32>,
    status: Arc<PipelineStatus>,
}

impl ToneGenerator {
    /// `duration_secs` 为 None 时无限输出
    pub fn new(frequency: f64, amplitude: f64, duration_secs: Option<f64>) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            duration_secs,
            format: None,
            remaining: None,
            phase: 0.0,
            step: 0.0,
            frame: Vec::new(),
            status: Arc::new(PipelineStatus::new()),
        }
    }

    /// 管线希望产出的格式
    pub fn requested_format(sample_rate: u32, channels: u16) -> AudioFormat {
        AudioFormat::new(sample_rate, channels, SampleFormat::Float)
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }
}

impl Pipeline for ToneGenerator {
    fn configure(&mut self, format: &AudioFormat) {
        self.format = Some(*format);
        self.step = TAU * self.frequency / format.sample_rate as f64;
        self.phase = 0.0;
        self.remaining = self
            .duration_secs
            .map(|secs| (secs.max(0.0) * format.sample_rate as f64).round() as u64);
        self.frame = vec![0; format.channels as usize];
        log::debug!(
            "Tone {:.1} Hz configured for {} Hz {} ch {}",
            self.frequency,
            format.sample_rate,
            format.channels,
            format.sample_format
        );
    }

    fn pull(&mut self, out: &mut [u8], _presentation_ns: u64) -> usize {
        let Some(format) = self.format else {
            return 0;
        };
        let bytes_per_frame = format.bytes_per_frame();

        let mut frames = out.len() / bytes_per_frame;
        if let Some(remaining) = self.remaining {
            frames = frames.min(remaining as usize);
        }

        let scale = self.amplitude * i32::MAX as f64;
        for chunk in out.chunks_exact_mut(bytes_per_frame).take(frames) {
            let sample = (self.phase.sin() * scale) as i32;
            self.frame.fill(sample);
            format.samples_to_bytes(&self.frame, chunk);

            self.phase += self.step;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= frames as u64;
            if *remaining == 0 {
                self.status.finish();
            }
        }
        self.status.advance(frames as u64);

        frames * bytes_per_frame
    }
}
