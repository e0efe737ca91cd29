//! 任务配置

use serde::{Deserialize, Serialize};

use crate::core::error::ConfigError;

/// 打码模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CensorMode {
    /// 所有检测到的人脸
    All,
    /// 仅与参考人脸匹配的
    One,
    /// 除参考人脸以外的全部
    AllExcept,
}

impl CensorMode {
    pub fn needs_matching(&self) -> bool {
        !matches!(self, CensorMode::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CensorStyle {
    Blur,
    Mask,
    Pixelate,
}

/// 检测精度档位：fast 对应 HOG 一类的快速检测，accurate 对应 CNN 一类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionProfile {
    Fast,
    Accurate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: CensorMode,
    pub censor_style: CensorStyle,
    pub detection_profile: DetectionProfile,
    /// 检测时的上采样次数，1..=10
    pub detection_upsample: u32,
    /// 检测前的缩放比例，(0, 1]
    pub detection_scale: f32,
    /// 每隔多少帧做一次完整检测
    pub frame_skip: u64,
    pub batch_size: usize,
    pub worker_count: usize,
    /// 同时在途的批次上限，超过后等待最早的批次
    pub max_in_flight_batches: usize,
    pub match_tolerance: f32,
    pub progress_interval_frames: u64,
    pub pixelate_tile: u32,
    pub blur_kernel: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let worker_count = default_worker_count();
        Self {
            mode: CensorMode::All,
            censor_style: CensorStyle::Blur,
            detection_profile: DetectionProfile::Fast,
            detection_upsample: 1,
            detection_scale: 1.0,
            frame_skip: 1,
            batch_size: 32,
            worker_count,
            max_in_flight_batches: worker_count * 2,
            match_tolerance: 0.6,
            progress_interval_frames: 10,
            pixelate_tile: 8,
            blur_kernel: 21,
        }
    }
}

impl PipelineConfig {
    /// 半分辨率检测、隔帧检测
    pub fn for_speed() -> Self {
        Self {
            detection_scale: 0.5,
            frame_skip: 2,
            ..Default::default()
        }
    }

    /// 全分辨率逐帧检测
    pub fn for_accuracy() -> Self {
        Self {
            detection_profile: DetectionProfile::Accurate,
            detection_scale: 1.0,
            frame_skip: 1,
            batch_size: 8,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.detection_upsample) {
            return Err(out_of_range(
                "detection_upsample",
                format!("must be in [1, 10], got {}", self.detection_upsample),
            ));
        }
        if !self.detection_scale.is_finite()
            || self.detection_scale <= 0.0
            || self.detection_scale > 1.0
        {
            return Err(out_of_range(
                "detection_scale",
                format!("must be in (0, 1], got {}", self.detection_scale),
            ));
        }
        if self.frame_skip == 0 {
            return Err(out_of_range("frame_skip", "must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(out_of_range("batch_size", "must be >= 1".into()));
        }
        if self.worker_count == 0 {
            return Err(out_of_range("worker_count", "must be >= 1".into()));
        }
        if self.max_in_flight_batches == 0 {
            return Err(out_of_range("max_in_flight_batches", "must be >= 1".into()));
        }
        if !self.match_tolerance.is_finite() || self.match_tolerance < 0.0 {
            return Err(out_of_range(
                "match_tolerance",
                format!("must be a non-negative number, got {}", self.match_tolerance),
            ));
        }
        if self.progress_interval_frames == 0 {
            return Err(out_of_range("progress_interval_frames", "must be >= 1".into()));
        }
        if self.pixelate_tile == 0 {
            return Err(out_of_range("pixelate_tile", "must be >= 1".into()));
        }
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            return Err(out_of_range(
                "blur_kernel",
                format!("must be odd, got {}", self.blur_kernel),
            ));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, reason: String) -> ConfigError {
    ConfigError::OutOfRange { field, reason }
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 8)
}

/// 写出器候选编码：fourcc 用于日志，encoder 为 ffmpeg 编码器名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkCodec {
    pub fourcc: String,
    pub encoder: String,
}

impl SinkCodec {
    pub fn new(fourcc: &str, encoder: &str) -> Self {
        Self {
            fourcc: fourcc.to_string(),
            encoder: encoder.to_string(),
        }
    }

    /// MPEG-4 → Motion-JPEG → raw
    pub fn fallback_chain() -> Vec<SinkCodec> {
        vec![
            SinkCodec::new("mp4v", "mpeg4"),
            SinkCodec::new("MJPG", "mjpeg"),
            SinkCodec::new("raw ", "rawvideo"),
        ]
    }
}

/// 音频合流时的视频重编码参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxSettings {
    pub video_codec: String,
    pub crf: u32,
    pub preset: String,
    pub audio_codec: String,
}

impl Default for RemuxSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            crf: 23,
            preset: "fast".to_string(),
            audio_codec: "aac".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub sink_codecs: Vec<SinkCodec>,
    pub remux: RemuxSettings,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            sink_codecs: SinkCodec::fallback_chain(),
            remux: RemuxSettings::default(),
        }
    }
}
