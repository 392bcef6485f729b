//! Core library for the ledwall renderer.
//!
//! A single procedurally generated canvas is rendered on its own thread and
//! resampled into any number of stages, one per physical LED panel. Each
//! stage publishes immutable snapshots that device schedulers read at their
//! own cadence, repack into wiring order and hand to a transport.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod inputs;
pub mod mapping;
pub mod output;
pub mod program;
pub mod registry;
pub mod render;
pub mod scene;
pub mod snapshot;
pub mod stage;
pub mod timeline;
pub mod transport;

pub use analysis::{BeatDetector, SpectrumReducer};
pub use audio::{AudioAnalysis, AudioPump, SampleSource, TestTone};
pub use config::{AppConfig, AudioConfig, DeviceConfig, PhysicalSize, RendererConfig};
pub use engine::Engine;
pub use error::{LedWallError, Result};
pub use inputs::{AlbumArt, InputFrame, RenderInputs};
pub use mapping::{AddressingTable, ScanAxis, StartX, StartY, WiringConfig};
pub use output::{DeviceScheduler, SchedulerState, SchedulerStats};
pub use program::Program;
pub use registry::{LiveStages, PendingChanges, StageHandle, StageRegistry};
pub use render::{Canvas, DisplaySurface, RenderGraph, Renderer};
pub use scene::{ProgramSource, SceneDescriptor, SceneKind};
pub use snapshot::{Snapshot, SnapshotPublisher, SnapshotReader};
pub use stage::{FilterMode, ResampleStage, SourceRect, StageConfig, StageId};
pub use timeline::{tick_interval, FramePacer};
pub use transport::{FrameLog, MemoryTransport, Transport, UdpTransport};
