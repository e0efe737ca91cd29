//! 媒体读写与音频合流
//!
//! 容器解复用/复用与音频编码交给外部工具（ffmpeg / ffprobe），
//! 这里只定义管线依赖的接口。

pub mod ffmpeg;
pub mod finalizer;
pub mod memory;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::config::{RemuxSettings, SinkCodec};
use crate::core::error::{MediaError, PipelineError, RemuxError};
use crate::core::video::frame::Frame;

pub use ffmpeg::FfmpegMedia;
pub use finalizer::{publish, temp_output_path, AudioOutcome, FinalizeOutcome, Finalizer};
pub use memory::MemoryMedia;

/// 源视频头信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 容器声明的帧数，可能多于实际可解码帧数
    pub frame_count: u64,
    pub codec_tag: String,
}

pub trait FrameSource: Send {
    fn info(&self) -> &VideoInfo;

    /// 顺序读取下一帧；流结束（包括不完整的尾帧）返回 None
    fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError>;
}

pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError>;

    /// 刷新并关闭写出器
    fn finish(self: Box<Self>) -> Result<(), PipelineError>;
}

pub trait VideoIo: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError>;

    fn create_sink(
        &self,
        path: &Path,
        codec: &SinkCodec,
        info: &VideoInfo,
    ) -> Result<Box<dyn FrameSink>, MediaError>;
}

pub trait AudioRemuxer: Send + Sync {
    fn has_audio_stream(&self, path: &Path) -> Result<bool, MediaError>;

    /// 将 video_only 的画面与 original 的音轨合成到 output
    fn remux(
        &self,
        video_only: &Path,
        original: &Path,
        output: &Path,
        settings: &RemuxSettings,
    ) -> Result<(), RemuxError>;
}
