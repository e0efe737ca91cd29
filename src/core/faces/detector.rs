use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbImage;

use crate::core::config::DetectionProfile;
use crate::core::error::RegionDetectionError;
use crate::core::video::frame::Region;

/// 人脸检测能力，由外部库实现
pub trait RegionDetector: Send + Sync {
    /// 返回 image 坐标系下的候选区域
    fn detect(
        &self,
        image: &RgbImage,
        upsample: u32,
        profile: DetectionProfile,
    ) -> Result<Vec<Region>, RegionDetectionError>;
}

/// 按检测档位分发到快速 / 精确两个后端
pub struct ProfiledDetector {
    fast: Arc<dyn RegionDetector>,
    accurate: Arc<dyn RegionDetector>,
}

impl ProfiledDetector {
    pub fn new(fast: Arc<dyn RegionDetector>, accurate: Arc<dyn RegionDetector>) -> Self {
        Self { fast, accurate }
    }
}

impl RegionDetector for ProfiledDetector {
    fn detect(
        &self,
        image: &RgbImage,
        upsample: u32,
        profile: DetectionProfile,
    ) -> Result<Vec<Region>, RegionDetectionError> {
        match profile {
            DetectionProfile::Fast => self.fast.detect(image, upsample, profile),
            DetectionProfile::Accurate => self.accurate.detect(image, upsample, profile),
        }
    }
}

type DetectFn = Box<dyn Fn(&RgbImage) -> Result<Vec<Region>, RegionDetectionError> + Send + Sync>;

pub struct MockRegionDetector {
    // 模拟检测结果
    pattern: Option<DetectFn>,
    calls: AtomicUsize,
}

impl MockRegionDetector {
    /// 永远检测不到人脸
    pub fn new() -> Self {
        Self {
            pattern: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(&RgbImage) -> Result<Vec<Region>, RegionDetectionError> + Send + Sync + 'static,
    {
        Self {
            pattern: Some(Box::new(pattern)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fixed_regions(regions: Vec<Region>) -> Self {
        Self::with_pattern(move |_| Ok(regions.clone()))
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::with_pattern(move |_| Err(RegionDetectionError(message.clone())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRegionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionDetector for MockRegionDetector {
    fn detect(
        &self,
        image: &RgbImage,
        _upsample: u32,
        _profile: DetectionProfile,
    ) -> Result<Vec<Region>, RegionDetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.pattern {
            Some(pattern) => pattern(image),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_counts_calls() {
        let detector = MockRegionDetector::with_fixed_regions(vec![Region::new(0, 4, 4, 0)]);
        let image = RgbImage::new(8, 8);

        for _ in 0..3 {
            let regions = detector.detect(&image, 1, DetectionProfile::Fast).unwrap();
            assert_eq!(regions.len(), 1);
        }
        assert_eq!(detector.call_count(), 3);
    }

    #[test]
    fn test_failing_mock() {
        let detector = MockRegionDetector::failing("model crashed");
        let err = detector
            .detect(&RgbImage::new(4, 4), 1, DetectionProfile::Fast)
            .unwrap_err();
        assert!(err.to_string().contains("model crashed"));
    }

    #[test]
    fn test_profiled_detector_dispatch() {
        let fast = Arc::new(MockRegionDetector::with_fixed_regions(vec![Region::new(0, 1, 1, 0)]));
        let accurate = Arc::new(MockRegionDetector::new());
        let detector = ProfiledDetector::new(fast.clone(), accurate.clone());
        let image = RgbImage::new(4, 4);

        let regions = detector.detect(&image, 1, DetectionProfile::Fast).unwrap();
        assert_eq!(regions.len(), 1);
        let regions = detector.detect(&image, 1, DetectionProfile::Accurate).unwrap();
        assert!(regions.is_empty());

        assert_eq!(fast.call_count(), 1);
        assert_eq!(accurate.call_count(), 1);
    }
}
