//! 内存媒体后端，用于测试
//!
//! 源视频由预置帧提供；写出器在创建时即落盘一个文件，
//! 帧原始字节追加写入，finish 时帧列表保存以供断言。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::config::{RemuxSettings, SinkCodec};
use crate::core::error::{MediaError, PipelineError, RemuxError};
use crate::core::media::{AudioRemuxer, FrameSink, FrameSource, VideoInfo, VideoIo};
use crate::core::video::frame::Frame;

#[derive(Clone)]
struct SourceEntry {
    info: VideoInfo,
    frames: Vec<Frame>,
}

#[derive(Default)]
pub struct MemoryMedia {
    sources: HashMap<PathBuf, SourceEntry>,
    failing_codecs: HashSet<String>,
    has_audio: bool,
    failing_remux: bool,
    failing_probe: bool,
    written: Arc<Mutex<HashMap<PathBuf, Vec<Frame>>>>,
    remux_calls: Arc<Mutex<Vec<(PathBuf, PathBuf, PathBuf)>>>,
}

impl MemoryMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>, info: VideoInfo, frames: Vec<Frame>) -> Self {
        self.sources.insert(path.into(), SourceEntry { info, frames });
        self
    }

    pub fn with_failing_codec(mut self, encoder: &str) -> Self {
        self.failing_codecs.insert(encoder.to_string());
        self
    }

    pub fn with_audio(mut self, has_audio: bool) -> Self {
        self.has_audio = has_audio;
        self
    }

    pub fn with_failing_remux(mut self) -> Self {
        self.failing_remux = true;
        self
    }

    pub fn with_failing_probe(mut self) -> Self {
        self.failing_probe = true;
        self
    }

    /// 已 finish 的写出器写下的帧
    pub fn written_frames(&self, path: &Path) -> Option<Vec<Frame>> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// (video_only, original, output)
    pub fn remux_calls(&self) -> Vec<(PathBuf, PathBuf, PathBuf)> {
        self.remux_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl VideoIo for MemoryMedia {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        let entry = self
            .sources
            .get(path)
            .ok_or_else(|| MediaError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(MemorySource {
            info: entry.info.clone(),
            frames: entry.frames.iter().cloned().collect(),
        }))
    }

    fn create_sink(
        &self,
        path: &Path,
        codec: &SinkCodec,
        info: &VideoInfo,
    ) -> Result<Box<dyn FrameSink>, MediaError> {
        if self.failing_codecs.contains(&codec.encoder) {
            return Err(MediaError::EncoderUnavailable(codec.encoder.clone()));
        }
        let file = File::create(path)?;
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            width: info.width,
            height: info.height,
            writer: BufWriter::new(file),
            frames: Vec::new(),
            store: Arc::clone(&self.written),
        }))
    }
}

impl AudioRemuxer for MemoryMedia {
    fn has_audio_stream(&self, path: &Path) -> Result<bool, MediaError> {
        if self.failing_probe {
            return Err(MediaError::Probe(format!("cannot probe {:?}", path)));
        }
        Ok(self.has_audio)
    }

    fn remux(
        &self,
        video_only: &Path,
        original: &Path,
        output: &Path,
        _settings: &RemuxSettings,
    ) -> Result<(), RemuxError> {
        self.remux_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((
                video_only.to_path_buf(),
                original.to_path_buf(),
                output.to_path_buf(),
            ));

        if self.failing_remux {
            // 模拟编码器中途失败留下的半成品
            std::fs::write(output, b"partial")?;
            return Err(MediaError::Failed {
                tool: "ffmpeg",
                status: Some(1),
                stderr: "simulated remux failure".to_string(),
            }
            .into());
        }
        std::fs::copy(video_only, output)?;
        Ok(())
    }
}

pub struct MemorySource {
    info: VideoInfo,
    frames: VecDeque<Frame>,
}

impl FrameSource for MemorySource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        Ok(self.frames.pop_front())
    }
}

pub struct MemorySink {
    path: PathBuf,
    width: u32,
    height: u32,
    writer: BufWriter<File>,
    frames: Vec<Frame>,
    store: Arc<Mutex<HashMap<PathBuf, Vec<Frame>>>>,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(PipelineError::SinkWrite(format!(
                "frame {} has unexpected size {}x{}",
                frame.frame_number,
                frame.width(),
                frame.height()
            )));
        }
        self.writer.write_all(frame.as_raw())?;
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), PipelineError> {
        self.writer.flush()?;
        let frames = std::mem::take(&mut self.frames);
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.path.clone(), frames);
        Ok(())
    }
}
