//! Contrast-limited adaptive histogram equalisation on luminance.
//!
//! Chroma is kept; only Y (BT.601) is equalised per tile with a clip limit, and
//! tile mappings are blended bilinearly so tile borders do not show.

use image::{Rgb, RgbImage};

pub const DEFAULT_CLIP_LIMIT: f32 = 2.0;
pub const DEFAULT_TILES: u32 = 8;

/// Equalise `image` with an 8x8 tile grid and clip limit 2.0.
pub fn enhance_contrast(image: &RgbImage) -> RgbImage {
    clahe(image, DEFAULT_TILES, DEFAULT_CLIP_LIMIT)
}

pub fn clahe(image: &RgbImage, tiles: u32, clip_limit: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let tiles_x = tiles.clamp(1, width);
    let tiles_y = tiles.clamp(1, height);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);

    let luma: Vec<u8> = image.pixels().map(|p| to_ycbcr(p).0).collect();
    let luts = tile_luts(&luma, width, height, tiles_x, tiles_y, tile_w, tile_h, clip_limit);

    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let (_, cb, cr) = to_ycbcr(pixel);
        let old = luma[(y * width + x) as usize];

        // Tile-centre coordinates of this pixel.
        let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let x0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
        let y0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let x1 = (x0 + 1).min(tiles_x - 1);
        let y1 = (y0 + 1).min(tiles_y - 1);
        let fx = (gx - x0 as f32).clamp(0.0, 1.0);
        let fy = (gy - y0 as f32).clamp(0.0, 1.0);

        let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][old as usize] as f32;
        let top = lut(x0, y0) * (1.0 - fx) + lut(x1, y0) * fx;
        let bottom = lut(x0, y1) * (1.0 - fx) + lut(x1, y1) * fx;
        let new = top * (1.0 - fy) + bottom * fy;

        out.put_pixel(x, y, from_ycbcr(new, cb, cr));
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn tile_luts(
    luma: &[u8],
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    tile_w: u32,
    tile_h: u32,
    clip_limit: f32,
) -> Vec<[u8; 256]> {
    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x_start = tx * tile_w;
            let y_start = ty * tile_h;
            let x_end = (x_start + tile_w).min(width);
            let y_end = (y_start + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y_start..y_end {
                let row = (y * width) as usize;
                for x in x_start..x_end {
                    hist[luma[row + x as usize] as usize] += 1;
                }
            }
            let count = (x_end.saturating_sub(x_start) * y_end.saturating_sub(y_start)).max(1);
            luts.push(equalize(&mut hist, count, clip_limit));
        }
    }
    luts
}

/// Clip the histogram, spread the excess evenly, and turn the CDF into a mapping.
fn equalize(hist: &mut [u32; 256], count: u32, clip_limit: f32) -> [u8; 256] {
    let limit = ((clip_limit * count as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let bonus = excess / 256;
    let mut residual = excess % 256;
    for bin in hist.iter_mut() {
        *bin += bonus;
        if residual > 0 {
            *bin += 1;
            residual -= 1;
        }
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    let scale = 255.0 / count as f32;
    for (value, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[value] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

fn to_ycbcr(pixel: &Rgb<u8>) -> (u8, f32, f32) {
    let [r, g, b] = pixel.0.map(f32::from);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y.round().clamp(0.0, 255.0) as u8, cb, cr)
}

fn from_ycbcr(y: f32, cb: f32, cr: f32) -> Rgb<u8> {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    Rgb([r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8))
}
