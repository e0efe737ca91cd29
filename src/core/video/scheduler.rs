use std::sync::Arc;

use log::{debug, warn};

use crate::core::config::{DetectionProfile, PipelineConfig};
use crate::core::error::RegionDetectionError;
use crate::core::faces::RegionDetector;
use crate::core::video::frame::{Frame, Region};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleAction {
    /// 本帧运行检测
    Detect,
    /// 复用上一次检测结果
    Reuse,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub frame_skip: u64,
    pub scale: f32,
    pub upsample: u32,
    pub profile: DetectionProfile,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            scale: 1.0,
            upsample: 1,
            profile: DetectionProfile::Fast,
        }
    }
}

impl ScheduleConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            frame_skip: config.frame_skip.max(1),
            scale: config.detection_scale,
            upsample: config.detection_upsample,
            profile: config.detection_profile,
        }
    }
}

/// 检测调度器：每 frame_skip 帧检测一次，其余帧复用最近结果
///
/// 首次检测之前缓存为空，早期帧不会被打码。跳过的帧不做跟踪或插值。
pub struct DetectionScheduler {
    detector: Arc<dyn RegionDetector>,
    config: ScheduleConfig,
    last_regions: Vec<Region>,
    detections_run: u64,
    detection_failures: u64,
}

impl DetectionScheduler {
    pub fn new(detector: Arc<dyn RegionDetector>) -> Self {
        Self::with_config(detector, ScheduleConfig::default())
    }

    pub fn with_config(detector: Arc<dyn RegionDetector>, config: ScheduleConfig) -> Self {
        Self {
            detector,
            config,
            last_regions: Vec::new(),
            detections_run: 0,
            detection_failures: 0,
        }
    }

    pub fn action_for(&self, frame_index: u64) -> ScheduleAction {
        if frame_index % self.config.frame_skip == 0 {
            ScheduleAction::Detect
        } else {
            ScheduleAction::Reuse
        }
    }

    pub fn next_regions(&mut self, frame_index: u64, frame: &Frame) -> Vec<Region> {
        match self.action_for(frame_index) {
            ScheduleAction::Reuse => self.last_regions.clone(),
            ScheduleAction::Detect => {
                self.detections_run += 1;
                let regions = match self.detect_scaled(frame) {
                    Ok(regions) => regions,
                    Err(e) => {
                        // 该帧按无人脸处理
                        self.detection_failures += 1;
                        warn!("⚠️ Frame {}: {}", frame_index, e);
                        Vec::new()
                    }
                };
                debug!("Frame {}: {} regions detected", frame_index, regions.len());
                self.last_regions = regions.clone();
                regions
            }
        }
    }

    fn detect_scaled(&self, frame: &Frame) -> Result<Vec<Region>, RegionDetectionError> {
        if self.config.scale >= 1.0 {
            return self
                .detector
                .detect(&frame.image, self.config.upsample, self.config.profile);
        }

        let small = frame.scaled(self.config.scale);
        let factor = 1.0 / self.config.scale as f64;
        let regions = self
            .detector
            .detect(&small, self.config.upsample, self.config.profile)?;

        Ok(regions.iter().map(|r| r.rescale(factor)).collect())
    }

    pub fn last_regions(&self) -> &[Region] {
        &self.last_regions
    }

    pub fn detections_run(&self) -> u64 {
        self.detections_run
    }

    pub fn detection_failures(&self) -> u64 {
        self.detection_failures
    }

    pub fn reset(&mut self) {
        self.last_regions.clear();
        self.detections_run = 0;
        self.detection_failures = 0;
    }
}
