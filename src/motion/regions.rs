//! Binary mask cleanup and connected-region extraction.

use image::GrayImage;
use serde::Serialize;

use super::background::FOREGROUND;

/// 5x5 elliptical structuring element (rows of the ellipse, 1 = member).
const ELLIPSE_5X5: [[u8; 5]; 5] = [
    [0, 0, 1, 0, 0],
    [1, 1, 1, 1, 1],
    [1, 1, 1, 1, 1],
    [1, 1, 1, 1, 1],
    [0, 0, 1, 0, 0],
];

/// Axis-aligned region of connected foreground pixels. Bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MotionRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    /// Foreground pixel count.
    pub area: u32,
}

impl MotionRegion {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1 + 1
    }

    /// Map from a `scale`-downsampled mask back to frame coordinates.
    pub fn rescale(&self, scale: f64, max_width: u32, max_height: u32) -> MotionRegion {
        if scale >= 1.0 || scale <= 0.0 {
            return *self;
        }
        let up = |v: u32, limit: u32| ((v as f64 / scale).round() as u32).min(limit.saturating_sub(1));
        MotionRegion {
            x1: up(self.x1, max_width),
            y1: up(self.y1, max_height),
            x2: up(self.x2 + 1, max_width),
            y2: up(self.y2 + 1, max_height),
            area: (self.area as f64 / (scale * scale)).round() as u32,
        }
    }
}

fn morph(mask: &GrayImage, dilate: bool) -> GrayImage {
    let (width, height) = mask.dimensions();
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            // Erode keeps a pixel only if every kernel neighbour is set; dilate sets
            // it if any is. Neighbours outside the image are ignored.
            let mut hit = !dilate;
            'kernel: for (ky, row) in ELLIPSE_5X5.iter().enumerate() {
                for (kx, &member) in row.iter().enumerate() {
                    if member == 0 {
                        continue;
                    }
                    let nx = x as i64 + kx as i64 - 2;
                    let ny = y as i64 + ky as i64 - 2;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let set = mask.get_pixel(nx as u32, ny as u32)[0] == FOREGROUND;
                    if dilate && set {
                        hit = true;
                        break 'kernel;
                    }
                    if !dilate && !set {
                        hit = false;
                        break 'kernel;
                    }
                }
            }
            if hit {
                out.put_pixel(x, y, image::Luma([FOREGROUND]));
            }
        }
    }
    out
}

pub fn erode(mask: &GrayImage) -> GrayImage {
    morph(mask, false)
}

pub fn dilate(mask: &GrayImage) -> GrayImage {
    morph(mask, true)
}

/// Open (remove speckle) then close (fill pinholes).
pub fn denoise(mask: &GrayImage) -> GrayImage {
    let opened = dilate(&erode(mask));
    erode(&dilate(&opened))
}

/// 8-connected components of the foreground, in scan order.
pub fn connected_regions(mask: &GrayImage) -> Vec<MotionRegion> {
    let (width, height) = mask.dimensions();
    let mut visited = vec![false; (width * height) as usize];
    let mut regions = Vec::new();
    let mut stack: Vec<(u32, u32)> = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let index = (y * width + x) as usize;
            if visited[index] || mask.get_pixel(x, y)[0] != FOREGROUND {
                continue;
            }
            visited[index] = true;
            stack.push((x, y));
            let mut region = MotionRegion {
                x1: x,
                y1: y,
                x2: x,
                y2: y,
                area: 0,
            };

            while let Some((cx, cy)) = stack.pop() {
                region.area += 1;
                region.x1 = region.x1.min(cx);
                region.y1 = region.y1.min(cy);
                region.x2 = region.x2.max(cx);
                region.y2 = region.y2.max(cy);

                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = cx as i64 + dx;
                        let ny = cy as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        let n_index = (ny as u32 * width + nx as u32) as usize;
                        if !visited[n_index] && mask.get_pixel(nx as u32, ny as u32)[0] == FOREGROUND {
                            visited[n_index] = true;
                            stack.push((nx as u32, ny as u32));
                        }
                    }
                }
            }
            regions.push(region);
        }
    }
    regions
}
