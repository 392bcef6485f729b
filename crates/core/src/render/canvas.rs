use std::fmt;

use crate::{mapping::BYTES_PER_PIXEL, LedWallError, Result};

/// CPU render target holding RGB pixels, rows stored bottom-up.
#[derive(Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            width,
            height,
            pixels: allocate_target(width, height)?,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let px = &self.pixels[start..start + BYTES_PER_PIXEL];
        Some([px[0], px[1], px[2]])
    }

    /// Block lookup at normalized `(u, v)`, clamped to the edges.
    pub fn sample_nearest(&self, u: f32, v: f32) -> [u8; 3] {
        let x = texel(u, self.width);
        let y = texel(v, self.height);
        self.texel(x, y)
    }

    /// Bilinear lookup at normalized `(u, v)` between texel centres, clamped
    /// to the edges.
    pub fn sample_linear(&self, u: f32, v: f32) -> [u8; 3] {
        let (x0, x1, fx) = lerp_axis(u, self.width);
        let (y0, y1, fy) = lerp_axis(v, self.height);

        let a = self.texel(x0, y0);
        let b = self.texel(x1, y0);
        let c = self.texel(x0, y1);
        let d = self.texel(x1, y1);

        let mut out = [0u8; 3];
        for channel in 0..3 {
            let bottom = a[channel] as f32 + (b[channel] as f32 - a[channel] as f32) * fx;
            let top = c[channel] as f32 + (d[channel] as f32 - c[channel] as f32) * fx;
            out[channel] = (bottom + (top - bottom) * fy).round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    fn texel(&self, x: usize, y: usize) -> [u8; 3] {
        let start = (y * self.width as usize + x) * BYTES_PER_PIXEL;
        let px = &self.pixels[start..start + BYTES_PER_PIXEL];
        [px[0], px[1], px[2]]
    }
}

impl fmt::Debug for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canvas")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Allocates a zeroed `width` x `height` RGB buffer, reporting allocation
/// failure instead of aborting.
pub(crate) fn allocate_target(width: u32, height: u32) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(LedWallError::invalid(format!(
            "render target needs a non-empty size, got {width}x{height}"
        )));
    }
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| {
            LedWallError::ResourceAllocation(format!("render target {width}x{height} overflows"))
        })?;

    let mut pixels = Vec::new();
    pixels.try_reserve_exact(len).map_err(|err| {
        LedWallError::ResourceAllocation(format!("render target {width}x{height}: {err}"))
    })?;
    pixels.resize(len, 0);
    Ok(pixels)
}

fn texel(coord: f32, size: u32) -> usize {
    let max = size as usize - 1;
    if coord.is_nan() {
        return 0;
    }
    ((coord.clamp(0.0, 1.0) * size as f32) as usize).min(max)
}

fn lerp_axis(coord: f32, size: u32) -> (usize, usize, f32) {
    let max = size as usize - 1;
    let coord = if coord.is_nan() { 0.0 } else { coord };
    let pos = (coord.clamp(0.0, 1.0) * size as f32 - 0.5).clamp(0.0, max as f32);
    let lower = (pos.floor() as usize).min(max);
    let upper = (lower + 1).min(max);
    (lower, upper, pos - lower as f32)
}
