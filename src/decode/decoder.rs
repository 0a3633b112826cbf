//! 音频文件解码管线
//!
//! 使用 symphonia 解码 FLAC / WAV / AIFF / MP3，样本统一转为左对齐 i32，
//! 再按会话协商好的格式和声道数打包进 period buffer。
//!
//! 解码在 refill 回调里同步进行，每次只解一个 packet。

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::SampleFormat as SourceFormat;
use thiserror::Error;

use crate::audio::format::{AudioFormat, SampleFormat};
use crate::audio::refill::{Pipeline, PipelineStatus};

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 源文件的样本格式
    pub native_format: SampleFormat,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器格式名称（取自扩展名）
    pub format: String,
    pub codec: String,
}

impl AudioInfo {
    /// 管线向会话请求的格式
    pub fn requested_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.native_format)
    }
}

/// 源样本格式 → 管线格式
fn native_format(params: &CodecParameters) -> SampleFormat {
    match params.sample_format {
        Some(SourceFormat::U8 | SourceFormat::S8) => SampleFormat::U8,
        Some(SourceFormat::U16 | SourceFormat::S16) => SampleFormat::S16,
        Some(SourceFormat::U24 | SourceFormat::S24) => SampleFormat::S24,
        Some(SourceFormat::U32 | SourceFormat::S32) => SampleFormat::S32,
        Some(SourceFormat::F32) => SampleFormat::Float,
        Some(SourceFormat::F64) => SampleFormat::Double,
        // 有损格式通常不声明位深，解码结果是 f32
        None => match params.bits_per_sample {
            Some(8) => SampleFormat::U8,
            Some(16) => SampleFormat::S16,
            Some(24) => SampleFormat::S24,
            Some(32) => SampleFormat::S32,
            _ => SampleFormat::Float,
        },
    }
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    /// 交错 i32 转换缓冲，按最大 packet 复用
    sample_buf: Option<SampleBuffer<i32>>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let total_frames = params.n_frames;

        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            native_format: native_format(params),
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            sample_buf: None,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个 packet，交错样本写入 `out`（先清空）
    ///
    /// 返回 `Ok(false)` 表示文件结束
    pub fn decode_into(&mut self, out: &mut Vec<i32>) -> Result<bool, DecodeError> {
        out.clear();
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;
            let needed = decoded.capacity() * spec.channels.count();
            if self
                .sample_buf
                .as_ref()
                .is_some_and(|b| b.capacity() < needed)
            {
                self.sample_buf = None;
            }
            let buf = self
                .sample_buf
                .get_or_insert_with(|| SampleBuffer::new(duration, spec));

            buf.copy_interleaved_ref(decoded);
            out.extend_from_slice(buf.samples());
            return Ok(true);
        }
    }
}

/// 把一帧源声道映射到输出声道
///
/// - 声道数相同：直接复制
/// - 单声道源：复制到所有输出声道
/// - 单声道输出：取平均
/// - 其余：按位置对应，多余的源声道丢弃，缺少的输出静音
fn remap_channels(src: &[i32], dst: &mut [i32]) {
    if src.len() == dst.len() {
        dst.copy_from_slice(src);
    } else if src.len() == 1 {
        dst.fill(src[0]);
    } else if dst.len() == 1 {
        let sum: i64 = src.iter().map(|&s| s as i64).sum();
        dst[0] = (sum / src.len() as i64) as i32;
    } else {
        for (i, out) in dst.iter_mut().enumerate() {
            *out = src.get(i).copied().unwrap_or(0);
        }
    }
}

/// 文件解码管线
pub struct DecoderPipeline {
    decoder: AudioDecoder,
    source_channels: usize,
    format: Option<AudioFormat>,
    /// 当前 packet 的交错样本
    pending: Vec<i32>,
    position: usize,
    frame: Vec<i32>,
    eof: bool,
    status: Arc<PipelineStatus>,
}

impl DecoderPipeline {
    pub fn new(decoder: AudioDecoder) -> Self {
        let source_channels = (decoder.info().channels as usize).max(1);
        Self {
            decoder,
            source_channels,
            format: None,
            pending: Vec::new(),
            position: 0,
            frame: Vec::new(),
            eof: false,
            status: Arc::new(PipelineStatus::new()),
        }
    }

    pub fn info(&self) -> &AudioInfo {
        self.decoder.info()
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// 解码下一个 packet，文件结束或出错返回 false
    fn fill_pending(&mut self) -> bool {
        if self.eof {
            return false;
        }
        loop {
            match self.decoder.decode_into(&mut self.pending) {
                Ok(true) => {
                    self.position = 0;
                    if self.pending.len() >= self.source_channels {
                        return true;
                    }
                }
                Ok(false) => {
                    log::info!("Decoder reached end of file");
                    break;
                }
                Err(e) => {
                    log::error!("Decode error: {}", e);
                    break;
                }
            }
        }
        self.eof = true;
        self.status.finish();
        false
    }
}

impl Pipeline for DecoderPipeline {
    fn configure(&mut self, format: &AudioFormat) {
        let info = self.decoder.info();
        if format.sample_rate != info.sample_rate {
            log::warn!(
                "Output rate {} Hz differs from source rate {} Hz, playback speed will change",
                format.sample_rate,
                info.sample_rate
            );
        }
        if format.channels as usize != self.source_channels {
            log::info!(
                "Channel remap: {} → {}",
                self.source_channels,
                format.channels
            );
        }
        self.frame = vec![0; format.channels as usize];
        self.format = Some(*format);
    }

    fn pull(&mut self, out: &mut [u8], _presentation_ns: u64) -> usize {
        let Some(format) = self.format else {
            return 0;
        };
        let bytes_per_frame = format.bytes_per_frame();
        let source_channels = self.source_channels;

        let mut frames = 0usize;
        for chunk in out.chunks_exact_mut(bytes_per_frame) {
            if self.position + source_channels > self.pending.len() && !self.fill_pending() {
                break;
            }
            let src = &self.pending[self.position..self.position + source_channels];
            remap_channels(src, &mut self.frame);
            format.samples_to_bytes(&self.frame, chunk);
            self.position += source_channels;
            frames += 1;
        }

        self.status.advance(frames as u64);
        frames * bytes_per_frame
    }
}
