//! Fixture addressing: maps canvas pixel positions onto the order in which a
//! physical LED panel is wired.
//!
//! Snapshot rows are stored bottom-up (row 0 is the bottom of the image), so a
//! panel wired from its bottom edge needs no vertical correction while one
//! wired from the top is mirrored.

use serde::{Deserialize, Serialize};

use crate::{LedWallError, Result};

/// Bytes per pixel in snapshots and device buffers.
pub const BYTES_PER_PIXEL: usize = 3;

/// Primary direction in which a panel's LED chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAxis {
    /// Rows outer, columns inner.
    #[default]
    Horizontal,
    /// Columns outer, rows inner.
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartX {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartY {
    #[default]
    Bottom,
    Top,
}

/// Wiring parameters of a physical panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WiringConfig {
    /// Alternate the chain direction on every outer line.
    pub serpentine: bool,
    pub axis: ScanAxis,
    pub start_x: StartX,
    pub start_y: StartY,
}

/// Permutation mapping canvas pixel index (`y * width + x`) to the fixture
/// channel that pixel drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressingTable {
    width: usize,
    height: usize,
    channels: Box<[u32]>,
}

impl AddressingTable {
    /// Builds the table for a `width` x `height` panel.
    ///
    /// Each step permutes the previous result, so the output is a bijection
    /// over `0..width * height` by construction.
    pub fn generate(width: u32, height: u32, wiring: &WiringConfig) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(LedWallError::invalid(format!(
                "addressing table needs a non-empty panel, got {width}x{height}"
            )));
        }

        let w = width as usize;
        let h = height as usize;
        let len = w
            .checked_mul(h)
            .filter(|len| *len <= u32::MAX as usize)
            .ok_or_else(|| {
                LedWallError::invalid(format!("panel {width}x{height} has too many pixels"))
            })?;

        let mut channels = vec![0u32; len];

        match wiring.axis {
            ScanAxis::Horizontal => {
                for y in 0..h {
                    let mirrored = wiring.serpentine && y % 2 == 1;
                    for x in 0..w {
                        let along = if mirrored { w - 1 - x } else { x };
                        channels[y * w + x] = (y * w + along) as u32;
                    }
                }
            }
            ScanAxis::Vertical => {
                for x in 0..w {
                    let mirrored = wiring.serpentine && x % 2 == 1;
                    for y in 0..h {
                        let along = if mirrored { h - 1 - y } else { y };
                        channels[y * w + x] = (x * h + along) as u32;
                    }
                }
            }
        }

        if wiring.start_x == StartX::Right {
            for row in channels.chunks_exact_mut(w) {
                row.reverse();
            }
        }

        if wiring.start_y == StartY::Top {
            for y in 0..h / 2 {
                let (upper, lower) = channels.split_at_mut((h - 1 - y) * w);
                upper[y * w..(y + 1) * w].swap_with_slice(&mut lower[..w]);
            }
        }

        Ok(Self {
            width: w,
            height: h,
            channels: channels.into_boxed_slice(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of pixels (and channels) covered by the table.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.channels
    }

    /// Channel driven by the canvas pixel at `(x, y)`.
    pub fn channel(&self, x: usize, y: usize) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.channels.get(y * self.width + x).copied()
    }

    /// Length in bytes of a device buffer for this panel.
    pub fn buffer_len(&self) -> usize {
        self.channels.len() * BYTES_PER_PIXEL
    }

    /// Returns true when every channel in `0..len` appears exactly once.
    pub fn is_permutation(&self) -> bool {
        let mut seen = vec![false; self.channels.len()];
        for &channel in self.channels.iter() {
            match seen.get_mut(channel as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => return false,
            }
        }
        true
    }

    /// Copies row-major RGB `pixels` into `out` in wiring order.
    pub fn repack(&self, pixels: &[u8], out: &mut [u8]) -> Result<()> {
        let expected = self.buffer_len();
        if pixels.len() != expected || out.len() != expected {
            return Err(LedWallError::invalid(format!(
                "repack expects {expected} bytes, got {} in and {} out",
                pixels.len(),
                out.len()
            )));
        }

        for (pixel, &channel) in pixels
            .chunks_exact(BYTES_PER_PIXEL)
            .zip(self.channels.iter())
        {
            let start = channel as usize * BYTES_PER_PIXEL;
            out[start..start + BYTES_PER_PIXEL].copy_from_slice(pixel);
        }

        Ok(())
    }
}
