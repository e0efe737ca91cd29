//! 视频人脸打码

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::config::{MediaConfig, PipelineConfig};
use crate::core::error::{ErrorKind, JobFailure, PipelineError};
use crate::core::faces::{EuclideanMatcher, ReferenceSet, RegionDetector, RegionEncoder, RegionMatcher};
use crate::core::jobs::{JobId, JobRecord, JobReporter, JobStatus, JOBS};
use crate::core::media::{AudioRemuxer, FfmpegMedia, VideoIo};
use crate::core::video::pipeline::{CancellationToken, PipelineDriver};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CensorRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// mode 为 one / allexcept 时使用
    #[serde(default)]
    pub reference_images: Vec<PathBuf>,
    #[serde(default)]
    pub config: PipelineConfig,
}

impl CensorRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            reference_images: Vec::new(),
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_references(mut self, reference_images: Vec<PathBuf>) -> Self {
        self.reference_images = reference_images;
        self
    }
}

#[derive(Clone)]
struct Backends {
    video: Arc<dyn VideoIo>,
    remuxer: Arc<dyn AudioRemuxer>,
    detector: Arc<dyn RegionDetector>,
    encoder: Arc<dyn RegionEncoder>,
    matcher: Arc<dyn RegionMatcher>,
    media_config: MediaConfig,
}

/// 视频打码入口
///
/// ```ignore
/// let censor = VideoCensor::create(detector, encoder);
/// let job = censor.submit(CensorRequest::new("in.mp4", "out.mp4"))?;
/// println!("{}%", job.progress());
/// let status = job.join();
/// ```
pub struct VideoCensor {
    backends: Backends,
}

impl VideoCensor {
    /// 使用 ffmpeg 后端与欧氏距离匹配
    pub fn create(detector: Arc<dyn RegionDetector>, encoder: Arc<dyn RegionEncoder>) -> Self {
        crate::init_logging();
        let media_config = MediaConfig::default();
        let media = Arc::new(FfmpegMedia::from_config(&media_config));
        if !media.is_available() {
            warn!("⚠️ ffmpeg not found at '{}'", media_config.ffmpeg_path);
        }
        info!("🎬 VideoCensor: created");
        Self {
            backends: Backends {
                video: media.clone(),
                remuxer: media,
                detector,
                encoder,
                matcher: Arc::new(EuclideanMatcher),
                media_config,
            },
        }
    }

    pub fn with_backends(
        video: Arc<dyn VideoIo>,
        remuxer: Arc<dyn AudioRemuxer>,
        detector: Arc<dyn RegionDetector>,
        encoder: Arc<dyn RegionEncoder>,
        matcher: Arc<dyn RegionMatcher>,
    ) -> Self {
        Self {
            backends: Backends {
                video,
                remuxer,
                detector,
                encoder,
                matcher,
                media_config: MediaConfig::default(),
            },
        }
    }

    #[must_use]
    pub fn with_media_config(mut self, media_config: MediaConfig) -> Self {
        self.backends.media_config = media_config;
        self
    }

    /// 校验请求并在独立线程上启动任务
    pub fn submit(&self, request: CensorRequest) -> Result<CensorJob, PipelineError> {
        request.config.validate()?;

        let record = JOBS.register();
        let token = CancellationToken::new();
        info!(
            "🎬 Job {}: {:?} -> {:?} (mode {:?}, style {:?})",
            record.id(),
            request.input,
            request.output,
            request.config.mode,
            request.config.censor_style
        );

        let backends = self.backends.clone();
        let job_record = Arc::clone(&record);
        let job_token = token.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("censor-job-{}", short_id(record.id())))
            .spawn(move || run_job(request, backends, job_record, job_token));

        match spawned {
            Ok(handle) => Ok(CensorJob {
                record,
                token,
                handle: Some(handle),
            }),
            Err(e) => {
                record.fail(JobFailure::new(ErrorKind::Internal, e.to_string()));
                Err(PipelineError::Io(e))
            }
        }
    }

    /// 按 id 查询任意任务状态
    pub fn status(id: &str) -> Option<JobStatus> {
        JOBS.status(id)
    }

    /// 从注册表移除已结束的任务
    pub fn forget(id: &str) -> bool {
        match JOBS.get(id) {
            Some(record) if record.status().is_terminal() => JOBS.remove(id).is_some(),
            _ => false,
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn run_job(
    request: CensorRequest,
    backends: Backends,
    record: Arc<JobRecord>,
    token: CancellationToken,
) {
    let config = request.config;
    let references = if config.mode.needs_matching() {
        let references = ReferenceSet::load(
            &request.reference_images,
            backends.detector.as_ref(),
            backends.encoder.as_ref(),
            config.detection_profile,
        );
        if references.is_empty() {
            warn!(
                "⚠️ Job {}: no usable reference faces, frames pass through unchanged",
                record.id()
            );
        }
        references
    } else {
        ReferenceSet::empty()
    };

    let id = record.id().to_string();
    let mut driver = PipelineDriver::new(
        config,
        backends.video,
        backends.remuxer,
        backends.detector,
    )
    .with_matching(backends.encoder, backends.matcher, references)
    .with_reporter(Arc::new(JobReporter::new(record)))
    .with_cancellation(token)
    .with_media_config(backends.media_config);

    match driver.run(&request.input, &request.output) {
        Ok(outcome) => debug!("Job {} stats: {:?}", id, outcome.stats),
        Err(e) => debug!("Job {} ended with {:?}", id, e.kind()),
    }
}

/// 运行中任务的句柄；drop 不会停止任务
pub struct CensorJob {
    record: Arc<JobRecord>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CensorJob {
    pub fn id(&self) -> JobId {
        self.record.id().to_string()
    }

    /// 请求停止：不再读新帧，在途批次排空后以 Cancelled 失败结束
    pub fn cancel(&self) {
        info!("⏹️ Job {}: stop requested", self.record.id());
        self.token.cancel();
    }

    pub fn status(&self) -> JobStatus {
        self.record.status()
    }

    pub fn progress(&self) -> u8 {
        self.record.status().progress()
    }

    pub fn is_finished(&self) -> bool {
        self.record.status().is_terminal()
    }

    /// 等待任务结束并返回终态
    pub fn join(mut self) -> JobStatus {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                self.record.fail(JobFailure::new(
                    ErrorKind::Internal,
                    "job thread panicked",
                ));
            }
        }
        self.record.status()
    }
}

impl Drop for CensorJob {
    fn drop(&mut self) {
        info!("🗑️ CensorJob {}: handle released", self.record.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CensorMode, CensorStyle};
    use crate::core::faces::{MeanColorEncoder, MockRegionDetector};
    use crate::core::media::{MemoryMedia, VideoInfo};
    use crate::core::video::frame::{Frame, Region};
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::time::Duration;

    struct Workspace {
        dir: PathBuf,
    }

    impl Workspace {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("{}_{}", name, uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.join(name)
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn memory_media(input: &Path, frames: u64) -> Arc<MemoryMedia> {
        let info = VideoInfo {
            width: 32,
            height: 24,
            fps: 30.0,
            frame_count: frames,
            codec_tag: "avc1".to_string(),
        };
        let frames = (0..frames)
            .map(|i| Frame::new(RgbImage::from_pixel(32, 24, Rgb([180, 180, 180])), i))
            .collect();
        Arc::new(MemoryMedia::new().with_source(input, info, frames))
    }

    fn censor_with(media: &Arc<MemoryMedia>, detector: Arc<MockRegionDetector>) -> VideoCensor {
        VideoCensor::with_backends(
            media.clone(),
            media.clone(),
            detector,
            Arc::new(MeanColorEncoder),
            Arc::new(EuclideanMatcher),
        )
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            censor_style: CensorStyle::Mask,
            worker_count: 2,
            max_in_flight_batches: 2,
            batch_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_and_join_completes() {
        let ws = Workspace::new("api_complete");
        let media = memory_media(&ws.path("in.mp4"), 12);
        let censor = censor_with(
            &media,
            Arc::new(MockRegionDetector::with_fixed_regions(vec![Region::new(2, 12, 12, 2)])),
        );

        let job = censor
            .submit(CensorRequest::new(ws.path("in.mp4"), ws.path("out.mp4")).with_config(small_config()))
            .unwrap();
        let id = job.id();

        match job.join() {
            JobStatus::Completed {
                progress,
                output_file,
                remux_error,
            } => {
                assert_eq!(progress, 100);
                assert_eq!(output_file, ws.path("out.mp4"));
                assert!(remux_error.is_none());
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(ws.path("out.mp4").exists());
        assert!(matches!(VideoCensor::status(&id), Some(JobStatus::Completed { .. })));
        assert!(VideoCensor::forget(&id));
        assert!(VideoCensor::status(&id).is_none());
    }

    #[test]
    fn test_invalid_config_rejected_before_registration() {
        let ws = Workspace::new("api_invalid");
        let media = memory_media(&ws.path("in.mp4"), 1);
        let censor = censor_with(&media, Arc::new(MockRegionDetector::new()));
        let config = PipelineConfig {
            blur_kernel: 4,
            ..small_config()
        };

        let result = censor.submit(CensorRequest::new(ws.path("in.mp4"), ws.path("out.mp4")).with_config(config));
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_source_fails_job() {
        let ws = Workspace::new("api_missing");
        let media = memory_media(&ws.path("in.mp4"), 1);
        let censor = censor_with(&media, Arc::new(MockRegionDetector::new()));

        let job = censor
            .submit(CensorRequest::new(ws.path("other.mp4"), ws.path("out.mp4")).with_config(small_config()))
            .unwrap();

        match job.join() {
            JobStatus::Failed { error } => {
                assert_eq!(error.error_type, ErrorKind::SourceOpen);
                assert!(!error.message.is_empty());
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_running_job() {
        let ws = Workspace::new("api_cancel");
        let media = memory_media(&ws.path("in.mp4"), 400);
        let detector = Arc::new(MockRegionDetector::with_pattern(|_| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Vec::new())
        }));
        let censor = censor_with(&media, detector);

        let job = censor
            .submit(CensorRequest::new(ws.path("in.mp4"), ws.path("out.mp4")).with_config(small_config()))
            .unwrap();
        job.cancel();

        match job.join() {
            JobStatus::Failed { error } => assert_eq!(error.error_type, ErrorKind::Cancelled),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(!ws.path("out.mp4").exists());
    }

    #[test]
    fn test_matching_mode_without_references_passes_through() {
        let ws = Workspace::new("api_no_refs");
        let media = memory_media(&ws.path("in.mp4"), 3);
        let censor = censor_with(
            &media,
            Arc::new(MockRegionDetector::with_fixed_regions(vec![Region::new(2, 12, 12, 2)])),
        );
        let config = PipelineConfig {
            mode: CensorMode::AllExcept,
            ..small_config()
        };

        let job = censor
            .submit(
                CensorRequest::new(ws.path("in.mp4"), ws.path("out.mp4"))
                    .with_config(config)
                    .with_references(vec![ws.path("missing_face.jpg")]),
            )
            .unwrap();
        assert!(matches!(job.join(), JobStatus::Completed { .. }));

        let written = media
            .written_frames(&ws.path("out_temp.mp4"))
            .unwrap();
        assert!(written
            .iter()
            .all(|f| f.image.pixels().all(|p| p == &Rgb([180, 180, 180]))));
    }

    #[test]
    fn test_request_from_json() {
        let request: CensorRequest = serde_json::from_str(
            r#"{"input": "a.mp4", "output": "b.mp4", "config": {"mode": "one", "frame_skip": 3}}"#,
        )
        .unwrap();
        assert_eq!(request.config.mode, CensorMode::One);
        assert_eq!(request.config.frame_skip, 3);
        assert!(request.reference_images.is_empty());
    }
}
