use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

/// 帧数据结构，RGB 三通道
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: RgbImage,
    pub frame_number: u64,
}

impl Frame {
    pub fn new(image: RgbImage, frame_number: u64) -> Self {
        Self {
            image,
            frame_number,
        }
    }

    /// 从原始 RGB24 字节构造，长度不符时返回 None
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>, frame_number: u64) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|image| Self::new(image, frame_number))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel_count(&self) -> usize {
        (self.width() * self.height()) as usize
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// 按比例缩放（线性插值），用于低分辨率检测
    pub fn scaled(&self, scale: f32) -> RgbImage {
        if scale >= 1.0 {
            return self.image.clone();
        }
        let target_width = ((self.width() as f32 * scale).round() as u32).max(1);
        let target_height = ((self.height() as f32 * scale).round() as u32).max(1);
        imageops::resize(
            &self.image,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        )
    }
}

/// 人脸区域 (top, right, bottom, left)，源帧像素坐标，可能越界
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl Region {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// 四个坐标各自乘以 factor 后四舍五入
    pub fn rescale(&self, factor: f64) -> Region {
        let scale = |v: i32| (v as f64 * factor).round() as i32;
        Region {
            top: scale(self.top),
            right: scale(self.right),
            bottom: scale(self.bottom),
            left: scale(self.left),
        }
    }

    /// 裁剪到帧范围内；面积为 0 时返回 None
    pub fn clamp(&self, width: u32, height: u32) -> Option<PixelRect> {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;

        let top = self.top.clamp(0, h);
        let bottom = self.bottom.clamp(0, h);
        let left = self.left.clamp(0, w);
        let right = self.right.clamp(0, w);

        if bottom <= top || right <= left {
            return None;
        }

        Some(PixelRect {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }
}

/// 裁剪后的矩形，保证在帧内且面积非零
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let data = vec![255u8; 100 * 100 * 3];
        let frame = Frame::from_raw(100, 100, data, 30).unwrap();

        assert_eq!(frame.width(), 100);
        assert_eq!(frame.height(), 100);
        assert_eq!(frame.pixel_count(), 10000);
        assert_eq!(frame.frame_number, 30);
    }

    #[test]
    fn test_frame_from_short_buffer() {
        assert!(Frame::from_raw(10, 10, vec![0u8; 299], 0).is_none());
    }

    #[test]
    fn test_frame_scaled() {
        let frame = Frame::new(RgbImage::new(100, 60), 0);
        let small = frame.scaled(0.5);
        assert_eq!(small.dimensions(), (50, 30));

        let same = frame.scaled(1.0);
        assert_eq!(same.dimensions(), (100, 60));

        let tiny = frame.scaled(0.001);
        assert_eq!(tiny.dimensions(), (1, 1));
    }

    #[test]
    fn test_region_rescale_rounds_each_coordinate() {
        let region = Region::new(10, 31, 25, 3);
        assert_eq!(region.rescale(2.0), Region::new(20, 62, 50, 6));

        let odd = Region::new(1, 3, 5, 7).rescale(1.0 / 0.3);
        assert_eq!(odd, Region::new(3, 10, 17, 23));
    }

    #[test]
    fn test_region_clamp() {
        let region = Region::new(-5, 120, 50, 10);
        let rect = region.clamp(100, 80).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 10,
                y: 0,
                width: 90,
                height: 50
            }
        );
    }

    #[test]
    fn test_region_clamp_degenerate() {
        assert!(Region::new(10, 20, 10, 5).clamp(100, 100).is_none());
        assert!(Region::new(200, 20, 300, 5).clamp(100, 100).is_none());
        assert!(Region::new(5, -1, 20, -30).clamp(100, 100).is_none());
    }
}
