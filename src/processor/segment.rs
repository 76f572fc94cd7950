//! Foreground/background segmentation
//!
//! [`BorderKeySegmenter`] treats the photo border as backdrop: it estimates
//! the backdrop colour from the border ring, flood-fills every pixel
//! connected to the border that is close to that colour, and ramps alpha
//! across the tolerance band so edges stay soft. Pixels similar to the
//! backdrop but enclosed by the subject are kept.

use crate::error::PhotoError;
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::collections::VecDeque;

/// Produces an alpha mask (255 = foreground) for an RGB image
pub trait Segmenter: Send + Sync {
    fn alpha_mask(&self, image: &RgbImage) -> Result<GrayImage, PhotoError>;
}

/// Border-keyed segmentation for studio-style ID photos
#[derive(Debug, Clone)]
pub struct BorderKeySegmenter {
    /// Colour distance below which a pixel is pure backdrop
    pub tolerance: f32,
    /// Width of the soft edge band above `tolerance`
    pub feather: f32,
    /// Fraction of the shorter side sampled as border
    pub border_fraction: f32,
}

impl Default for BorderKeySegmenter {
    fn default() -> Self {
        Self {
            tolerance: 40.0,
            feather: 30.0,
            border_fraction: 0.02,
        }
    }
}

impl BorderKeySegmenter {
    /// Per-channel median of the border ring
    fn backdrop(&self, image: &RgbImage, ring: u32) -> Rgb<u8> {
        let (width, height) = image.dimensions();
        let mut histograms = [[0u32; 256]; 3];
        let mut count = 0u32;

        for y in 0..height {
            let in_band = y < ring || y >= height.saturating_sub(ring);
            for x in 0..width {
                if in_band || x < ring || x >= width.saturating_sub(ring) {
                    let p = image.get_pixel(x, y).0;
                    for c in 0..3 {
                        histograms[c][p[c] as usize] += 1;
                    }
                    count += 1;
                }
            }
        }

        let half = count / 2;
        let mut median = [0u8; 3];
        for c in 0..3 {
            let mut seen = 0u32;
            for (value, n) in histograms[c].iter().enumerate() {
                seen += n;
                if seen > half {
                    median[c] = value as u8;
                    break;
                }
            }
        }
        Rgb(median)
    }

    fn ramp(&self, distance: f32) -> u8 {
        if distance <= self.tolerance {
            0
        } else if self.feather <= 0.0 || distance >= self.tolerance + self.feather {
            255
        } else {
            ((distance - self.tolerance) / self.feather * 255.0).round() as u8
        }
    }
}

fn distance(a: &Rgb<u8>, b: &Rgb<u8>) -> f32 {
    let mut sum = 0.0f32;
    for c in 0..3 {
        let d = a.0[c] as f32 - b.0[c] as f32;
        sum += d * d;
    }
    sum.sqrt()
}

impl Segmenter for BorderKeySegmenter {
    fn alpha_mask(&self, image: &RgbImage) -> Result<GrayImage, PhotoError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PhotoError::ProcessingFailed("empty image".into()));
        }

        let ring = ((width.min(height) as f32 * self.border_fraction) as u32).max(1);
        let backdrop = self.backdrop(image, ring);
        let limit = self.tolerance + self.feather.max(0.0);

        let mut mask = GrayImage::from_pixel(width, height, Luma([255]));
        let mut visited = vec![false; (width as usize) * (height as usize)];
        let mut queue = VecDeque::new();
        let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;

        // Seed from the outermost pixel ring
        for x in 0..width {
            queue.push_back((x, 0));
            queue.push_back((x, height - 1));
        }
        for y in 0..height {
            queue.push_back((0, y));
            queue.push_back((width - 1, y));
        }

        while let Some((x, y)) = queue.pop_front() {
            let i = index(x, y);
            if visited[i] {
                continue;
            }
            visited[i] = true;

            let d = distance(image.get_pixel(x, y), &backdrop);
            if d >= limit {
                continue;
            }
            mask.put_pixel(x, y, Luma([self.ramp(d)]));

            if x > 0 {
                queue.push_back((x - 1, y));
            }
            if x + 1 < width {
                queue.push_back((x + 1, y));
            }
            if y > 0 {
                queue.push_back((x, y - 1));
            }
            if y + 1 < height {
                queue.push_back((x, y + 1));
            }
        }

        Ok(mask)
    }
}
