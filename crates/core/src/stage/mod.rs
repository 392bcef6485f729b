//! Resample stages: fixed-resolution views onto a region of the canvas.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    mapping::BYTES_PER_PIXEL,
    render::{canvas::allocate_target, Canvas},
    snapshot::SnapshotPublisher,
    LedWallError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Block replication.
    #[default]
    Nearest,
    /// Bilinear interpolation.
    Linear,
}

/// Region of the canvas, normalized against its size with the origin at the
/// bottom-left corner. Parts outside `[0, 1]` clamp to the canvas edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRect {
    pub offset_x: f32,
    pub offset_y: f32,
    pub size_x: f32,
    pub size_y: f32,
}

impl SourceRect {
    pub fn full() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            size_x: 1.0,
            size_y: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [self.offset_x, self.offset_y, self.size_x, self.size_y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.size_x <= 0.0 || self.size_y <= 0.0 {
            return Err(LedWallError::invalid(format!(
                "source rectangle must have finite values and positive size, got {self:?}"
            )));
        }
        Ok(())
    }
}

impl Default for SourceRect {
    fn default() -> Self {
        Self::full()
    }
}

/// Resolution, canvas region and filter of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub rect: SourceRect,
    #[serde(default)]
    pub filter: FilterMode,
}

impl StageConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rect: SourceRect::full(),
            filter: FilterMode::Nearest,
        }
    }

    pub fn with_rect(mut self, rect: SourceRect) -> Self {
        self.rect = rect;
        self
    }

    pub fn with_filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LedWallError::invalid(format!(
                "stage resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        self.rect.validate()
    }
}

/// Identifier assigned to a stage when it is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) u64);

impl StageId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// A live stage owned by the render thread.
pub struct ResampleStage {
    id: StageId,
    config: StageConfig,
    target: Vec<u8>,
    publisher: SnapshotPublisher,
}

impl ResampleStage {
    /// Allocates the stage's render target.
    pub fn allocate(id: StageId, config: StageConfig, publisher: SnapshotPublisher) -> Result<Self> {
        config.validate()?;
        let target = allocate_target(config.width, config.height)?;
        Ok(Self {
            id,
            config,
            target,
            publisher,
        })
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// Resamples the configured canvas region into the stage target.
    ///
    /// Must only run once the canvas has been fully drawn for this tick.
    pub fn render(&mut self, canvas: &Canvas) {
        let StageConfig {
            width,
            height,
            rect,
            filter,
        } = self.config;
        let inv_w = 1.0 / width as f32;
        let inv_h = 1.0 / height as f32;

        for (ty, row) in self
            .target
            .chunks_exact_mut(width as usize * BYTES_PER_PIXEL)
            .enumerate()
        {
            let v = rect.offset_y + (ty as f32 + 0.5) * inv_h * rect.size_y;
            for (tx, px) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let u = rect.offset_x + (tx as f32 + 0.5) * inv_w * rect.size_x;
                let rgb = match filter {
                    FilterMode::Nearest => canvas.sample_nearest(u, v),
                    FilterMode::Linear => canvas.sample_linear(u, v),
                };
                px.copy_from_slice(&rgb);
            }
        }
    }

    /// Publishes a copy of the current target. Returns the snapshot version.
    pub fn publish(&self) -> Result<u64> {
        self.publisher
            .publish(self.config.width, self.config.height, &self.target)
    }
}

impl fmt::Debug for ResampleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResampleStage")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}
