//! 人脸特征编码与比对

use std::path::PathBuf;

use image::RgbImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::config::DetectionProfile;
use crate::core::error::EncodeError;
use crate::core::faces::detector::RegionDetector;
use crate::core::video::frame::Region;

/// 定长特征向量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint(Vec<f32>);

impl Fingerprint {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 欧氏距离；维度不一致时为无穷大
    pub fn distance(&self, other: &Fingerprint) -> f32 {
        if self.len() != other.len() {
            return f32::INFINITY;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

pub trait RegionEncoder: Send + Sync {
    fn encode(&self, image: &RgbImage, region: &Region) -> Result<Fingerprint, EncodeError>;
}

pub trait RegionMatcher: Send + Sync {
    fn matches(&self, fingerprint: &Fingerprint, references: &[Fingerprint], tolerance: f32) -> bool;
}

/// 任一参考特征距离 ≤ tolerance 即视为同一人
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl RegionMatcher for EuclideanMatcher {
    fn matches(&self, fingerprint: &Fingerprint, references: &[Fingerprint], tolerance: f32) -> bool {
        references
            .iter()
            .any(|reference| fingerprint.distance(reference) <= tolerance)
    }
}

/// 区域平均颜色作为特征（用于测试和降级场景）
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanColorEncoder;

impl RegionEncoder for MeanColorEncoder {
    fn encode(&self, image: &RgbImage, region: &Region) -> Result<Fingerprint, EncodeError> {
        let rect = region
            .clamp(image.width(), image.height())
            .ok_or_else(|| EncodeError(format!("region {:?} is outside the image", region)))?;

        let mut sums = [0u64; 3];
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                let pixel = image.get_pixel(x, y);
                for (sum, value) in sums.iter_mut().zip(pixel.0.iter()) {
                    *sum += *value as u64;
                }
            }
        }

        let count = (rect.width as u64 * rect.height as u64) as f32;
        Ok(Fingerprint::new(
            sums.iter().map(|s| *s as f32 / count / 255.0).collect(),
        ))
    }
}

/// 任务级参考特征集合，创建后只读
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    fingerprints: Vec<Fingerprint>,
}

impl ReferenceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fingerprints(fingerprints: Vec<Fingerprint>) -> Self {
        Self { fingerprints }
    }

    /// 每张参考图取第一张检测到的人脸编码；失败的图片跳过
    pub fn from_images(
        images: &[RgbImage],
        detector: &dyn RegionDetector,
        encoder: &dyn RegionEncoder,
        profile: DetectionProfile,
    ) -> Self {
        let fingerprints = images
            .iter()
            .enumerate()
            .filter_map(|(index, image)| {
                match encode_first_face(image, detector, encoder, profile) {
                    Ok(Some(fingerprint)) => Some(fingerprint),
                    Ok(None) => {
                        warn!("⚠️ Reference image #{} contains no face, skipped", index);
                        None
                    }
                    Err(e) => {
                        warn!("⚠️ Reference image #{} could not be encoded: {}", index, e);
                        None
                    }
                }
            })
            .collect::<Vec<_>>();

        info!(
            "✅ Reference set ready: {}/{} images usable",
            fingerprints.len(),
            images.len()
        );
        Self { fingerprints }
    }

    pub fn load(
        paths: &[PathBuf],
        detector: &dyn RegionDetector,
        encoder: &dyn RegionEncoder,
        profile: DetectionProfile,
    ) -> Self {
        let images: Vec<RgbImage> = paths
            .iter()
            .filter_map(|path| match image::open(path) {
                Ok(img) => Some(img.to_rgb8()),
                Err(e) => {
                    warn!("⚠️ Error loading reference face {:?}: {}", path, e);
                    None
                }
            })
            .collect();
        Self::from_images(&images, detector, encoder, profile)
    }

    pub fn as_slice(&self) -> &[Fingerprint] {
        &self.fingerprints
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

fn encode_first_face(
    image: &RgbImage,
    detector: &dyn RegionDetector,
    encoder: &dyn RegionEncoder,
    profile: DetectionProfile,
) -> Result<Option<Fingerprint>, Box<dyn std::error::Error>> {
    let regions = detector.detect(image, 1, profile)?;
    match regions.first() {
        Some(region) => Ok(Some(encoder.encode(image, region)?)),
        None => Ok(None),
    }
}
