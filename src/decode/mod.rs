//! 文件解码

mod decoder;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError, DecoderPipeline};
