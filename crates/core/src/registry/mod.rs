//! Stage registration.
//!
//! [`StageRegistry`] is the cross-thread request side: any thread may ask for
//! stages to be added or removed, or for the canvas to be resized. Requests
//! are queued and applied by [`LiveStages`] on the render thread at the start
//! of a tick, so the set of stages never changes while a frame is drawn. The
//! running image program is swapped the same way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    program::Program,
    render::Canvas,
    snapshot::{SnapshotPublisher, SnapshotReader},
    stage::{ResampleStage, StageConfig, StageId},
    LedWallError, Result,
};

#[derive(Debug)]
pub(crate) enum RenderCommand {
    AddStage {
        id: StageId,
        config: StageConfig,
        publisher: SnapshotPublisher,
    },
    RemoveStage(StageId),
    ResizeCanvas {
        width: u32,
        height: u32,
    },
    SetProgram(Program),
}

/// Canvas-wide changes drained at the start of a tick.
#[derive(Debug, Default)]
pub struct PendingChanges {
    /// Last requested canvas resolution.
    pub resize: Option<(u32, u32)>,
    /// Last requested image program.
    pub program: Option<Program>,
}

/// Caller-side reference to a requested stage.
///
/// The handle is valid immediately; whether the stage has rendered yet is
/// visible through [`StageHandle::reader`].
#[derive(Debug, Clone)]
pub struct StageHandle {
    id: StageId,
    config: StageConfig,
    reader: SnapshotReader,
}

impl StageHandle {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn reader(&self) -> &SnapshotReader {
        &self.reader
    }

    pub fn is_ready(&self) -> bool {
        self.reader.is_ready()
    }
}

/// Thread-safe request queue for the render thread's stage set.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    tx: Sender<RenderCommand>,
    next_id: Arc<AtomicU64>,
    closed: Arc<RwLock<bool>>,
}

impl StageRegistry {
    /// Creates a registry and the render-thread side that consumes it.
    pub fn new() -> (Self, LiveStages) {
        let (tx, rx) = unbounded();
        let closed = Arc::new(RwLock::new(false));
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
                closed: closed.clone(),
            },
            LiveStages {
                queue: rx,
                stages: Vec::new(),
                closed,
            },
        )
    }

    /// Queues a new stage. Invalid configurations are rejected here and never
    /// reach the render thread.
    pub fn add_stage(&self, config: StageConfig) -> Result<StageHandle> {
        config.validate()?;
        let id = StageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let publisher = SnapshotPublisher::new();
        let reader = publisher.reader();

        self.send(RenderCommand::AddStage {
            id,
            config,
            publisher,
        })?;
        debug!(stage = %id, width = config.width, height = config.height, "stage requested");

        Ok(StageHandle { id, config, reader })
    }

    /// Queues removal of a stage. Snapshots already handed out stay readable.
    pub fn remove_stage(&self, id: StageId) -> Result<()> {
        self.send(RenderCommand::RemoveStage(id))
    }

    /// Queues a canvas resolution change for the next tick.
    pub fn resize_canvas(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(LedWallError::invalid(format!(
                "canvas resolution must be non-zero, got {width}x{height}"
            )));
        }
        self.send(RenderCommand::ResizeCanvas { width, height })
    }

    /// Queues `program` to replace the running one at the next tick.
    pub fn set_program(&self, program: Program) -> Result<()> {
        self.send(RenderCommand::SetProgram(program))?;
        debug!("program swap requested");
        Ok(())
    }

    /// Compiles `source` on the calling thread and queues it. Build errors
    /// are returned here and the running program is left untouched.
    pub fn load_program(&self, source: &str) -> Result<()> {
        self.set_program(Program::compile(source)?)
    }

    fn send(&self, command: RenderCommand) -> Result<()> {
        // held across the send so shutdown cannot drain in between
        let closed = self
            .closed
            .read()
            .map_err(|_| LedWallError::msg("stage registry has been poisoned"))?;
        if *closed {
            return Err(LedWallError::Shutdown);
        }
        self.tx.send(command).map_err(|_| LedWallError::Shutdown)
    }
}

/// The live stage set, owned by the render thread.
#[derive(Debug)]
pub struct LiveStages {
    queue: Receiver<RenderCommand>,
    stages: Vec<ResampleStage>,
    closed: Arc<RwLock<bool>>,
}

impl LiveStages {
    /// Applies every queued stage request and returns the canvas-wide
    /// changes for the caller to apply.
    pub fn apply_pending(&mut self) -> PendingChanges {
        let mut changes = PendingChanges::default();
        for command in self.queue.try_iter() {
            match command {
                RenderCommand::AddStage {
                    id,
                    config,
                    publisher,
                } => match ResampleStage::allocate(id, config, publisher) {
                    Ok(stage) => {
                        info!(stage = %id, width = config.width, height = config.height, "stage added");
                        self.stages.push(stage);
                    }
                    Err(err) => warn!(stage = %id, error = %err, "stage allocation failed"),
                },
                RenderCommand::RemoveStage(id) => {
                    let before = self.stages.len();
                    self.stages.retain(|stage| stage.id() != id);
                    if self.stages.len() < before {
                        info!(stage = %id, "stage removed");
                    } else {
                        debug!(stage = %id, "remove requested for unknown stage");
                    }
                }
                RenderCommand::ResizeCanvas { width, height } => {
                    changes.resize = Some((width, height))
                }
                RenderCommand::SetProgram(program) => changes.program = Some(program),
            }
        }
        changes
    }

    /// Resamples and publishes every stage from a fully drawn canvas.
    pub fn render_all(&mut self, canvas: &Canvas) {
        for stage in &mut self.stages {
            stage.render(canvas);
            if let Err(err) = stage.publish() {
                warn!(stage = %stage.id(), error = %err, "snapshot publish failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.stages.iter().any(|stage| stage.id() == id)
    }

    /// Closes the registry, drops queued requests and releases every stage.
    /// Returns the number of discarded requests.
    pub fn shutdown(&mut self) -> usize {
        match self.closed.write() {
            Ok(mut closed) => *closed = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        let discarded = self.queue.try_iter().count();
        self.stages.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn canvas() -> Canvas {
        let mut canvas = Canvas::new(2, 2).unwrap();
        canvas.pixels_mut().fill(7);
        canvas
    }

    #[test]
    fn requests_apply_only_when_drained() {
        let (registry, mut live) = StageRegistry::new();
        let handle = registry.add_stage(StageConfig::new(2, 1)).unwrap();
        assert!(live.is_empty());
        assert!(!handle.is_ready());

        assert!(live.apply_pending().resize.is_none());
        assert!(live.contains(handle.id()));
        assert!(!handle.is_ready());

        live.render_all(&canvas());
        assert!(handle.is_ready());
        assert_eq!(handle.reader().try_read().unwrap().data(), &[7; 6]);
    }

    #[test]
    fn invalid_stage_is_rejected_at_request_time() {
        let (registry, mut live) = StageRegistry::new();
        let err = registry.add_stage(StageConfig::new(0, 4)).unwrap_err();
        assert!(matches!(err, LedWallError::InvalidConfiguration(_)));
        live.apply_pending();
        assert!(live.is_empty());
    }

    #[test]
    fn removed_stage_keeps_last_snapshot() {
        let (registry, mut live) = StageRegistry::new();
        let handle = registry.add_stage(StageConfig::new(1, 1)).unwrap();
        live.apply_pending();
        live.render_all(&canvas());
        let held = handle.reader().try_read().unwrap();

        registry.remove_stage(handle.id()).unwrap();
        live.apply_pending();
        assert!(live.is_empty());

        assert_eq!(held.data(), &[7, 7, 7]);
        assert_eq!(handle.reader().try_read().unwrap().version(), 1);
    }

    #[test]
    fn requests_from_many_threads_get_unique_ids() {
        let (registry, mut live) = StageRegistry::new();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..8)
                        .map(|_| registry.add_stage(StageConfig::new(1, 1)).unwrap().id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<StageId> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);

        live.apply_pending();
        assert_eq!(live.len(), 32);
    }

    #[test]
    fn resize_keeps_last_request() {
        let (registry, mut live) = StageRegistry::new();
        assert!(registry.resize_canvas(0, 1).is_err());
        registry.resize_canvas(4, 4).unwrap();
        registry.resize_canvas(8, 2).unwrap();
        assert_eq!(live.apply_pending().resize, Some((8, 2)));
        assert!(live.apply_pending().resize.is_none());
    }

    #[test]
    fn program_swaps_are_compiled_before_queueing() {
        let (registry, mut live) = StageRegistry::new();
        assert!(matches!(
            registry.load_program("r = 1; g = ").unwrap_err(),
            LedWallError::ProgramBuild { .. }
        ));
        assert!(live.apply_pending().program.is_none());

        registry.load_program("r = 0; g = 0; b = 0").unwrap();
        registry.load_program("a = 1; r = a; g = a; b = a").unwrap();
        let program = live.apply_pending().program.unwrap();
        assert_eq!(program.slot_count(), 4);
    }

    #[test]
    fn failed_allocation_leaves_live_stages_alone() {
        let (registry, mut live) = StageRegistry::new();
        let kept = registry.add_stage(StageConfig::new(2, 1)).unwrap();
        live.apply_pending();
        live.render_all(&canvas());

        let huge = registry
            .add_stage(StageConfig::new(u32::MAX, u32::MAX))
            .unwrap();
        live.apply_pending();
        assert_eq!(live.len(), 1);
        assert!(!live.contains(huge.id()));

        live.render_all(&canvas());
        live.render_all(&canvas());
        assert_eq!(kept.reader().version(), 3);
        assert!(!huge.is_ready());
    }

    #[test]
    fn requests_after_shutdown_are_rejected() {
        let (registry, mut live) = StageRegistry::new();
        registry.add_stage(StageConfig::new(1, 1)).unwrap();
        assert_eq!(live.shutdown(), 1);

        // rejected while the render side still holds its queue
        assert!(matches!(
            registry.add_stage(StageConfig::new(1, 1)).unwrap_err(),
            LedWallError::Shutdown
        ));
        assert_eq!(live.shutdown(), 0);
        drop(live);

        let err = registry.add_stage(StageConfig::new(1, 1)).unwrap_err();
        assert!(matches!(err, LedWallError::Shutdown));
        assert!(matches!(
            registry.remove_stage(StageId(1)).unwrap_err(),
            LedWallError::Shutdown
        ));
    }
}
