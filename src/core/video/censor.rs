//! 打码变换：mask / pixelate / blur
//!
//! 所有变换只作用于裁剪后的区域内部，区域外像素保持不变。

use image::{imageops, Rgb, RgbImage};

use crate::core::config::{CensorStyle, PipelineConfig};
use crate::core::error::CensorApplyError;
use crate::core::video::frame::{PixelRect, Region};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CensorTransform {
    pub style: CensorStyle,
    pub pixelate_tile: u32,
    pub blur_kernel: u32,
}

impl CensorTransform {
    pub fn new(style: CensorStyle) -> Self {
        Self {
            style,
            pixelate_tile: 8,
            blur_kernel: 21,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            style: config.censor_style,
            pixelate_tile: config.pixelate_tile,
            blur_kernel: config.blur_kernel,
        }
    }

    pub fn apply(&self, image: &mut RgbImage, region: &Region) -> Result<(), CensorApplyError> {
        let (width, height) = image.dimensions();
        let rect = region
            .clamp(width, height)
            .ok_or(CensorApplyError::DegenerateRegion {
                region: *region,
                width,
                height,
            })?;

        match self.style {
            CensorStyle::Mask => mask(image, rect),
            CensorStyle::Pixelate => pixelate(image, rect, self.pixelate_tile),
            CensorStyle::Blur => gaussian_blur(image, rect, self.blur_kernel),
        }
        Ok(())
    }
}

pub fn mask(image: &mut RgbImage, rect: PixelRect) {
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            image.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
}

/// 线性插值缩小到 tile×tile，再最近邻放大回原尺寸
pub fn pixelate(image: &mut RgbImage, rect: PixelRect, tile: u32) {
    let tile_w = tile.clamp(1, rect.width);
    let tile_h = tile.clamp(1, rect.height);

    let region = imageops::crop_imm(&*image, rect.x, rect.y, rect.width, rect.height).to_image();
    let small = resize_bilinear(&region, tile_w, tile_h);

    for dy in 0..rect.height {
        let sy = (dy as u64 * tile_h as u64 / rect.height as u64) as u32;
        for dx in 0..rect.width {
            let sx = (dx as u64 * tile_w as u64 / rect.width as u64) as u32;
            image.put_pixel(rect.x + dx, rect.y + dy, *small.get_pixel(sx, sy));
        }
    }
}

/// 双线性缩放：目标像素中心映射回源图，取相邻 2×2 像素插值
///
/// 缩小时不扩大采样范围，与 OpenCV 的 INTER_LINEAR 一致。
pub fn resize_bilinear(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (src_w, src_h) = src.dimensions();
    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;

    RgbImage::from_fn(width, height, |dx, dy| {
        let (x0, x1, fx) = linear_taps(dx, scale_x, src_w);
        let (y0, y1, fy) = linear_taps(dy, scale_y, src_h);
        let p00 = src.get_pixel(x0, y0);
        let p10 = src.get_pixel(x1, y0);
        let p01 = src.get_pixel(x0, y1);
        let p11 = src.get_pixel(x1, y1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
            let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
            out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

fn linear_taps(d: u32, scale: f32, len: u32) -> (u32, u32, f32) {
    let pos = ((d as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (pos.floor() as u32).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, (pos - i0 as f32).clamp(0.0, 1.0))
}

/// 与 OpenCV sigma=0 时的推导一致
pub fn kernel_sigma(kernel_size: u32) -> f64 {
    0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn gaussian_kernel(kernel_size: u32) -> Vec<f32> {
    let size = kernel_size.max(1) | 1;
    let sigma = kernel_sigma(size);
    let half = (size / 2) as i64;

    let weights: Vec<f64> = (-half..=half)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();

    weights.iter().map(|w| (w / sum) as f32).collect()
}

/// 可分离高斯模糊，区域边界外按 0 填充
pub fn gaussian_blur(image: &mut RgbImage, rect: PixelRect, kernel_size: u32) {
    let kernel = gaussian_kernel(kernel_size);
    let half = (kernel.len() / 2) as i64;
    let w = rect.width as usize;
    let h = rect.height as usize;

    // 水平方向
    let mut horizontal = vec![0f32; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (k, weight) in kernel.iter().enumerate() {
                let sx = x as i64 + k as i64 - half;
                if sx < 0 || sx >= w as i64 {
                    continue;
                }
                let pixel = image.get_pixel(rect.x + sx as u32, rect.y + y as u32);
                for c in 0..3 {
                    acc[c] += weight * pixel[c] as f32;
                }
            }
            let idx = (y * w + x) * 3;
            horizontal[idx..idx + 3].copy_from_slice(&acc);
        }
    }

    // 垂直方向，写回原图
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (k, weight) in kernel.iter().enumerate() {
                let sy = y as i64 + k as i64 - half;
                if sy < 0 || sy >= h as i64 {
                    continue;
                }
                let idx = (sy as usize * w + x) * 3;
                for c in 0..3 {
                    acc[c] += weight * horizontal[idx + c];
                }
            }
            let out = Rgb([
                acc[0].round().clamp(0.0, 255.0) as u8,
                acc[1].round().clamp(0.0, 255.0) as u8,
                acc[2].round().clamp(0.0, 255.0) as u8,
            ]);
            image.put_pixel(rect.x + x as u32, rect.y + y as u32, out);
        }
    }
}
