//! 打码管线驱动
//!
//! 驱动线程顺序读帧、调度检测、攒批；批次交给线程池并行打码，
//! 结果按提交顺序写入临时文件，最后合入原始音轨并发布到输出路径。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::core::config::{MediaConfig, PipelineConfig, SinkCodec};
use crate::core::error::PipelineError;
use crate::core::faces::{
    EuclideanMatcher, MeanColorEncoder, ReferenceSet, RegionDetector, RegionEncoder,
    RegionMatcher,
};
use crate::core::media::{
    temp_output_path, AudioRemuxer, FinalizeOutcome, Finalizer, FrameSink, FrameSource,
    VideoInfo, VideoIo,
};
use crate::core::video::batch::{BatchBuffer, BatchExecutor, CensorContext};
use crate::core::video::frame::Frame;
use crate::core::video::progress::{NoopReporter, ProgressReporter, ProgressTracker};
use crate::core::video::scheduler::{DetectionScheduler, ScheduleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Opened,
    Processing,
    Finalizing,
    Completed,
    Failed,
}

/// 外部停止信号，可跨线程克隆
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub declared_frames: u64,
    pub frames_read: u64,
    pub frames_written: u64,
    pub detections_run: u64,
    pub detection_failures: u64,
    pub batches_dispatched: u64,
    /// 实际打开写出器的编码器
    pub codec: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub output_path: PathBuf,
    pub stats: PipelineStats,
    pub finalize: FinalizeOutcome,
}

impl PipelineOutcome {
    pub fn remux_error(&self) -> Option<&str> {
        self.finalize.remux_error()
    }
}

pub struct PipelineDriver {
    config: PipelineConfig,
    media_config: MediaConfig,
    video: Arc<dyn VideoIo>,
    remuxer: Arc<dyn AudioRemuxer>,
    detector: Arc<dyn RegionDetector>,
    encoder: Arc<dyn RegionEncoder>,
    matcher: Arc<dyn RegionMatcher>,
    references: Arc<ReferenceSet>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    state: PipelineState,
    stats: PipelineStats,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        video: Arc<dyn VideoIo>,
        remuxer: Arc<dyn AudioRemuxer>,
        detector: Arc<dyn RegionDetector>,
    ) -> Self {
        Self {
            config,
            media_config: MediaConfig::default(),
            video,
            remuxer,
            detector,
            encoder: Arc::new(MeanColorEncoder),
            matcher: Arc::new(EuclideanMatcher),
            references: Arc::new(ReferenceSet::empty()),
            reporter: Arc::new(NoopReporter),
            cancel: CancellationToken::new(),
            state: PipelineState::Idle,
            stats: PipelineStats::default(),
        }
    }

    #[must_use]
    pub fn with_matching(
        mut self,
        encoder: Arc<dyn RegionEncoder>,
        matcher: Arc<dyn RegionMatcher>,
        references: ReferenceSet,
    ) -> Self {
        self.encoder = encoder;
        self.matcher = matcher;
        self.references = Arc::new(references);
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_media_config(mut self, media_config: MediaConfig) -> Self {
        self.media_config = media_config;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 处理 input 并写出到 output
    ///
    /// 失败（包括取消）时删除临时文件，output 不会被写入。
    pub fn run(&mut self, input: &Path, output: &Path) -> Result<PipelineOutcome, PipelineError> {
        let temp = temp_output_path(output);
        self.stats = PipelineStats::default();
        self.state = PipelineState::Idle;

        match self.execute(input, output, &temp) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.transition(PipelineState::Failed);
                if temp.exists() {
                    if let Err(rm) = std::fs::remove_file(&temp) {
                        warn!("⚠️ Could not remove temp file {:?}: {}", temp, rm);
                    }
                }
                error!("❌ Censoring {:?} failed: {}", input, e);
                self.reporter.on_failure(e.kind(), &e.to_string());
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        input: &Path,
        output: &Path,
        temp: &Path,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut source = self
            .video
            .open_source(input)
            .map_err(|e| PipelineError::SourceOpen(e.to_string()))?;
        let info = source.info().clone();
        if info.frame_count == 0 || info.width == 0 || info.height == 0 {
            return Err(PipelineError::SourceOpen(format!(
                "{:?} reports {}x{} with {} frames",
                input, info.width, info.height, info.frame_count
            )));
        }
        self.stats.declared_frames = info.frame_count;
        self.transition(PipelineState::Opened);

        let (mut sink, codec) = self.open_sink(temp, &info)?;
        self.stats.codec = Some(codec.encoder.clone());

        self.transition(PipelineState::Processing);
        let progress = ProgressTracker::new(
            info.frame_count,
            self.config.progress_interval_frames,
            Arc::clone(&self.reporter),
        );
        let stopped = self.process_frames(source.as_mut(), sink.as_mut(), &progress)?;
        drop(source);

        // 读完所有帧之后才到达的停止请求不影响结果
        if stopped {
            return Err(PipelineError::Cancelled);
        }
        if self.stats.frames_read == 0 {
            return Err(PipelineError::SourceOpen(format!(
                "{:?} has no decodable frames",
                input
            )));
        }
        sink.finish()?;

        self.transition(PipelineState::Finalizing);
        let finalize =
            Finalizer::new(self.remuxer.as_ref(), &self.media_config.remux).finalize(input, temp, output)?;

        self.transition(PipelineState::Completed);
        progress.complete();
        self.reporter
            .on_complete(&finalize.output_path, finalize.remux_error());
        info!(
            "✅ {:?} done: {} frames written, {} detections",
            finalize.output_path, self.stats.frames_written, self.stats.detections_run
        );

        Ok(PipelineOutcome {
            output_path: finalize.output_path.clone(),
            stats: self.stats.clone(),
            finalize,
        })
    }

    /// 依次尝试候选编码，直到有一个能打开写出器
    fn open_sink(
        &self,
        temp: &Path,
        info: &VideoInfo,
    ) -> Result<(Box<dyn FrameSink>, SinkCodec), PipelineError> {
        let mut tried = Vec::new();
        for codec in &self.media_config.sink_codecs {
            match self.video.create_sink(temp, codec, info) {
                Ok(sink) => {
                    info!(
                        "🎞️ Writing {:?} with {} ({})",
                        temp, codec.encoder, codec.fourcc
                    );
                    return Ok((sink, codec.clone()));
                }
                Err(e) => {
                    warn!("⚠️ Codec {} unusable: {}", codec.encoder, e);
                    tried.push(codec.encoder.clone());
                    if temp.exists() {
                        let _ = std::fs::remove_file(temp);
                    }
                }
            }
        }
        Err(PipelineError::SinkCreate {
            tried: tried.join(", "),
        })
    }

    /// 返回读帧循环是否因停止请求而提前结束
    fn process_frames(
        &mut self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        progress: &ProgressTracker,
    ) -> Result<bool, PipelineError> {
        let context = CensorContext::new(
            &self.config,
            Arc::clone(&self.references),
            Arc::clone(&self.encoder),
            Arc::clone(&self.matcher),
        );
        // 线程池随 executor 在本函数退出时释放
        let mut executor = BatchExecutor::new(
            self.config.worker_count,
            self.config.max_in_flight_batches,
            context,
        )?;
        let mut scheduler = DetectionScheduler::with_config(
            Arc::clone(&self.detector),
            ScheduleConfig::from_pipeline(&self.config),
        );
        let mut buffer = BatchBuffer::new(self.config.batch_size);
        let mut frame_index = 0u64;
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                info!("⏹️ Stop requested after {} frames", frame_index);
                cancelled = true;
                break;
            }

            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️ Decoding stopped at frame {}: {}", frame_index, e);
                    break;
                }
            };

            let regions = scheduler.next_regions(frame_index, &frame);
            frame_index += 1;
            if let Some(batch) = buffer.push(frame, regions) {
                let ready = executor.submit(batch)?;
                self.write_frames(sink, ready, progress)?;
            }
        }

        self.stats.frames_read = frame_index;
        if !cancelled && frame_index < self.stats.declared_frames {
            warn!(
                "⚠️ Source ended after {} of {} declared frames",
                frame_index, self.stats.declared_frames
            );
        }

        // 取消时丢弃尚未派发的缓冲帧，只等待在途批次
        if !cancelled {
            if let Some(batch) = buffer.flush() {
                let ready = executor.submit(batch)?;
                self.write_frames(sink, ready, progress)?;
            }
        }
        let ready = executor.drain()?;
        self.write_frames(sink, ready, progress)?;

        self.stats.detections_run = scheduler.detections_run();
        self.stats.detection_failures = scheduler.detection_failures();
        self.stats.batches_dispatched = executor.dispatched();
        debug!("Processing finished: {:?}", self.stats);
        Ok(cancelled)
    }

    fn write_frames(
        &mut self,
        sink: &mut dyn FrameSink,
        frames: Vec<Frame>,
        progress: &ProgressTracker,
    ) -> Result<(), PipelineError> {
        for frame in frames {
            sink.write_frame(&frame)?;
            self.stats.frames_written += 1;
            progress.frames_written(self.stats.frames_written);
        }
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
