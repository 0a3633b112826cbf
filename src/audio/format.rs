//! 音频格式协商
//!
//! 从管线能产出的格式中挑选后端支持的 PCM 编码，并固定声道布局与采样率。
//!
//! 管线内部样本表示与解码器一致：所有位深统一左对齐到 i32 的高位
//! - 8-bit: 占据 bit[31:24]
//! - 16-bit: 占据 bit[31:16]
//! - 24-bit: 占据 bit[31:8]
//! - 32-bit: 占据 bit[31:0]

use super::output::OutputError;

/// 管线样本格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    Float,
    Double,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 6] = [
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::S24,
        SampleFormat::S32,
        SampleFormat::Float,
        SampleFormat::Double,
    ];

    /// 每样本的字节数
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::Float => 4,
            Self::Double => 8,
        }
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// 按优先级排列的候选输出格式（最佳在前）
    ///
    /// 浮点源优先退化到 s16，双精度源优先 s32。
    pub fn candidates(self) -> &'static [SampleFormat] {
        use SampleFormat::*;
        match self {
            U8 => &[U8, S16, S32],
            S16 => &[S16, S32, U8],
            S24 => &[S32, S16, U8],
            S32 => &[S32, S16, U8],
            Float => &[S16, S32, U8],
            Double => &[S32, S16, U8],
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 后端 PCM 位宽代码
pub const PCM_SAMPLE_FORMAT_FIXED_8: u32 = 8;
pub const PCM_SAMPLE_FORMAT_FIXED_16: u32 = 16;
pub const PCM_SAMPLE_FORMAT_FIXED_32: u32 = 32;

/// 管线格式 → 后端位宽代码
pub const FORMAT_MAP: [(SampleFormat, u32); 3] = [
    (SampleFormat::U8, PCM_SAMPLE_FORMAT_FIXED_8),
    (SampleFormat::S16, PCM_SAMPLE_FORMAT_FIXED_16),
    (SampleFormat::S32, PCM_SAMPLE_FORMAT_FIXED_32),
];

/// 查找格式对应的后端代码（不在表中返回 None）
pub fn backend_code(format: SampleFormat) -> Option<u32> {
    FORMAT_MAP
        .iter()
        .find(|(f, _)| *f == format)
        .map(|&(_, code)| code)
}

// 扬声器位掩码
pub const SPEAKER_FRONT_LEFT: u32 = 0x0001;
pub const SPEAKER_FRONT_RIGHT: u32 = 0x0002;
pub const SPEAKER_FRONT_CENTER: u32 = 0x0004;
pub const SPEAKER_LOW_FREQUENCY: u32 = 0x0008;
pub const SPEAKER_BACK_LEFT: u32 = 0x0010;
pub const SPEAKER_BACK_RIGHT: u32 = 0x0020;
pub const SPEAKER_SIDE_LEFT: u32 = 0x0200;
pub const SPEAKER_SIDE_RIGHT: u32 = 0x0400;

const MASK_STEREO: u32 = SPEAKER_FRONT_LEFT | SPEAKER_FRONT_RIGHT;
const MASK_QUAD: u32 = MASK_STEREO | SPEAKER_BACK_LEFT | SPEAKER_BACK_RIGHT;
const MASK_5_1: u32 = MASK_QUAD | SPEAKER_FRONT_CENTER | SPEAKER_LOW_FREQUENCY;
const MASK_7_1: u32 = MASK_5_1 | SPEAKER_SIDE_LEFT | SPEAKER_SIDE_RIGHT;

/// 已声明支持的声道布局
pub const CHANNEL_LAYOUTS: [(u16, u32); 5] = [
    (1, SPEAKER_FRONT_CENTER),
    (2, MASK_STEREO),
    (4, MASK_QUAD),
    (6, MASK_5_1),
    (8, MASK_7_1),
];

/// 声道数对应的扬声器掩码
pub fn channel_mask(channels: u16) -> Option<u32> {
    CHANNEL_LAYOUTS
        .iter()
        .find(|(n, _)| *n == channels)
        .map(|&(_, mask)| mask)
}

/// 后端的声道能力
///
/// 早期后端只接受立体声；之后的版本直接接受管线的声道数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// 固定为 2 声道，管线必须按立体声产出
    #[default]
    StereoOnly,
    /// 接受管线声道数（需有已声明的布局且不超过上限）
    Native { max_channels: u16 },
}

/// 字节序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big = 1,
    Little = 2,
}

/// 后端 PCM 数据格式描述
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmDescriptor {
    pub channels: u32,
    /// 单位是毫赫兹（采样率 × 1000）
    pub samples_per_sec: u32,
    pub bits_per_sample: u32,
    pub container_size: u32,
    pub channel_mask: u32,
    pub endianness: ByteOrder,
}

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// 创建新的音频格式
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes()
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    #[inline]
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// 将 i32 样本（左对齐）打包为输出字节（little-endian）
    ///
    /// 返回写入的字节数；输出空间不足时只写完整样本。
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) -> usize {
        let width = self.bytes_per_sample();
        let count = samples.len().min(output.len() / width);

        for (sample, out) in samples[..count]
            .iter()
            .zip(output.chunks_exact_mut(width))
        {
            match self.sample_format {
                SampleFormat::U8 => {
                    // 有符号 → 无符号偏移
                    out[0] = ((sample >> 24) + 128) as u8;
                }
                SampleFormat::S16 => {
                    out.copy_from_slice(&((sample >> 16) as i16).to_le_bytes());
                }
                SampleFormat::S24 => {
                    let bytes = sample.to_le_bytes();
                    out.copy_from_slice(&bytes[1..4]);
                }
                SampleFormat::S32 => {
                    out.copy_from_slice(&sample.to_le_bytes());
                }
                SampleFormat::Float => {
                    let v = *sample as f32 / 2_147_483_648.0;
                    out.copy_from_slice(&v.to_le_bytes());
                }
                SampleFormat::Double => {
                    let v = *sample as f64 / 2_147_483_648.0;
                    out.copy_from_slice(&v.to_le_bytes());
                }
            }
        }

        count * width
    }
}

/// 协商结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    /// 会话使用的格式（管线必须按此格式产出）
    pub format: AudioFormat,
    /// 交给后端的 PCM 描述
    pub pcm: PcmDescriptor,
}

/// 挑选双方都支持的编码并固定声道
///
/// `supported` 是后端声明支持的格式，只有同时出现在 [`FORMAT_MAP`] 中的才会被选中。
pub fn negotiate(
    requested: &AudioFormat,
    supported: &[SampleFormat],
    policy: ChannelPolicy,
) -> Result<Negotiated, OutputError> {
    let channels = match policy {
        ChannelPolicy::StereoOnly => 2,
        ChannelPolicy::Native { max_channels } => {
            if requested.channels == 0 || requested.channels > max_channels {
                return Err(OutputError::UnsupportedChannels(requested.channels));
            }
            requested.channels
        }
    };
    let channel_mask =
        channel_mask(channels).ok_or(OutputError::UnsupportedChannels(channels))?;

    let (sample_format, bits) = requested
        .sample_format
        .candidates()
        .iter()
        .filter(|f| supported.contains(*f))
        .find_map(|&f| backend_code(f).map(|code| (f, code)))
        .ok_or(OutputError::UnsupportedFormat(requested.sample_format))?;

    if sample_format != requested.sample_format {
        log::debug!(
            "Sample format {} → {} (backend compatible)",
            requested.sample_format,
            sample_format
        );
    }

    let format = AudioFormat::new(requested.sample_rate, channels, sample_format);
    let pcm = PcmDescriptor {
        channels: channels as u32,
        samples_per_sec: requested.sample_rate.saturating_mul(1000),
        bits_per_sample: bits,
        container_size: 8 * sample_format.bytes() as u32,
        channel_mask,
        endianness: ByteOrder::Little,
    };

    Ok(Negotiated { format, pcm })
}
