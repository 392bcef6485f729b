//! Canvas rendering and the render thread.
//!
//! The render thread owns the canvas and every live stage. Each tick it
//! applies queued registry requests, evaluates the image program into the
//! canvas, resamples and publishes every stage, then presents the canvas to an
//! attached surface.

pub mod canvas;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info, trace, warn};

pub use canvas::Canvas;

use crate::{
    config::RendererConfig,
    inputs::{InputFrame, RenderInputs},
    mapping::BYTES_PER_PIXEL,
    program::{PixelEnv, Program},
    registry::{LiveStages, StageRegistry},
    timeline::FramePacer,
    LedWallError, Result,
};

/// Destination that displays the canvas after each tick.
pub trait DisplaySurface: Send {
    fn present(&mut self, canvas: &Canvas) -> Result<()>;
}

/// Canvas, program and stage set driven one tick at a time.
pub struct RenderGraph {
    canvas: Canvas,
    program: Program,
    locals: Vec<f32>,
    stages: LiveStages,
    surface: Option<Box<dyn DisplaySurface>>,
    frames: u64,
}

impl RenderGraph {
    pub fn new(program: Program, width: u32, height: u32, stages: LiveStages) -> Result<Self> {
        let canvas = Canvas::new(width, height)?;
        Ok(Self {
            locals: vec![0.0; program.slot_count()],
            canvas,
            program,
            stages,
            surface: None,
            frames: 0,
        })
    }

    pub fn attach_surface(&mut self, surface: Box<dyn DisplaySurface>) {
        self.surface = Some(surface);
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn stages(&self) -> &LiveStages {
        &self.stages
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Runs one full tick.
    pub fn tick(&mut self, frame: &InputFrame) -> Result<()> {
        let changes = self.stages.apply_pending();
        if let Some(program) = changes.program {
            self.set_program(program);
            info!(locals = self.locals.len(), "program swapped");
        }
        if let Some((width, height)) = changes.resize {
            match Canvas::new(width, height) {
                Ok(canvas) => {
                    info!(width, height, "canvas resized");
                    self.canvas = canvas;
                }
                Err(err) => warn!(width, height, error = %err, "canvas resize failed"),
            }
        }

        self.draw(frame);
        self.stages.render_all(&self.canvas);
        self.frames += 1;

        if let Some(surface) = self.surface.as_mut() {
            surface.present(&self.canvas)?;
        }
        Ok(())
    }

    /// Replaces the image program, resizing the scratch slots to match.
    pub fn set_program(&mut self, program: Program) {
        self.locals.clear();
        self.locals.resize(program.slot_count(), 0.0);
        self.program = program;
    }

    /// Evaluates the program for every canvas pixel.
    pub fn draw(&mut self, frame: &InputFrame) {
        let width = self.canvas.width();
        let height = self.canvas.height();
        let inv_w = 1.0 / width as f32;
        let inv_h = 1.0 / height as f32;
        let program = &self.program;
        let locals = &mut self.locals;

        for (py, row) in self
            .canvas
            .pixels_mut()
            .chunks_exact_mut(width as usize * BYTES_PER_PIXEL)
            .enumerate()
        {
            for (px, out) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                let env = PixelEnv {
                    frame,
                    x: (px as f32 + 0.5) * inv_w,
                    y: (py as f32 + 0.5) * inv_h,
                    width: width as f32,
                    height: height as f32,
                };
                let rgb = program.shade(&env, locals);
                for (byte, value) in out.iter_mut().zip(rgb) {
                    *byte = (value * 255.0).round() as u8;
                }
            }
        }
    }

    /// Discards pending requests and releases every stage and the canvas.
    pub fn shutdown(mut self) {
        let discarded = self.stages.shutdown();
        if discarded > 0 {
            debug!(discarded, "dropped pending render requests");
        }
    }
}

impl std::fmt::Debug for RenderGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGraph")
            .field("canvas", &self.canvas)
            .field("stages", &self.stages.len())
            .field("frames", &self.frames)
            .finish()
    }
}

/// Handle to the dedicated render thread.
#[derive(Debug)]
pub struct Renderer {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<u64>>,
}

impl Renderer {
    /// Starts the render thread and returns it with the registry that feeds
    /// it. The program is compiled by the caller, so build failures surface
    /// before any thread starts.
    pub fn start(
        config: &RendererConfig,
        program: Program,
        inputs: Arc<RenderInputs>,
        surface: Option<Box<dyn DisplaySurface>>,
    ) -> Result<(Self, StageRegistry)> {
        let mut pacer = FramePacer::new(config.framerate)?;
        let (registry, stages) = StageRegistry::new();
        let mut graph = RenderGraph::new(program, config.width, config.height, stages)?;
        if let Some(surface) = surface {
            graph.attach_surface(surface);
        }

        let (stop_tx, stop_rx) = bounded(1);
        let framerate = config.framerate;
        let thread = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || {
                info!(framerate, "render thread started");
                loop {
                    let started = Instant::now();
                    match inputs.frame_at(started) {
                        Ok(frame) => {
                            if let Err(err) = graph.tick(&frame) {
                                warn!(error = %err, "present failed");
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "render inputs unavailable, stopping");
                            break;
                        }
                    }
                    trace!(frame = graph.frames(), elapsed = ?started.elapsed(), "tick");

                    if !pacer.wait_or_stop(&stop_rx) {
                        break;
                    }
                }

                let frames = graph.frames();
                let overruns = pacer.overruns();
                graph.shutdown();
                info!(frames, overruns, "render thread stopped");
                frames
            })
            .map_err(|err| LedWallError::msg(format!("failed to spawn render thread: {err}")))?;

        Ok((
            Self {
                stop_tx,
                thread: Some(thread),
            },
            registry,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Stops the render thread and waits for it to release its resources.
    /// Returns the number of frames rendered.
    pub fn stop(&mut self) -> u64 {
        let Some(thread) = self.thread.take() else {
            return 0;
        };
        let _ = self.stop_tx.try_send(());
        match thread.join() {
            Ok(frames) => frames,
            Err(_) => {
                error!("render thread panicked");
                0
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    fn graph(source: &str, width: u32, height: u32) -> (RenderGraph, StageRegistry) {
        let (registry, stages) = StageRegistry::new();
        let program = Program::compile(source).unwrap();
        (
            RenderGraph::new(program, width, height, stages).unwrap(),
            registry,
        )
    }

    struct CountingSurface(Arc<Mutex<u32>>);

    impl DisplaySurface for CountingSurface {
        fn present(&mut self, _canvas: &Canvas) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn draw_evaluates_program_per_pixel() {
        let (mut graph, _registry) = graph("r = x; g = y; b = 1", 2, 2);
        graph.draw(&InputFrame::default());
        // pixel centres at 0.25 and 0.75, rows bottom-up
        assert_eq!(graph.canvas().pixel(0, 0), Some([64, 64, 255]));
        assert_eq!(graph.canvas().pixel(1, 1), Some([191, 191, 255]));
    }

    #[test]
    fn numeric_anomalies_do_not_stop_rendering() {
        let (mut graph, _registry) = graph("r = 1 / (x - x); g = sqrt(-1); b = log(0)", 2, 1);
        graph.tick(&InputFrame::default()).unwrap();
        graph.tick(&InputFrame::default()).unwrap();
        assert_eq!(graph.frames(), 2);
        assert_eq!(graph.canvas().pixel(0, 0), Some([255, 0, 0]));
    }

    #[test]
    fn tick_publishes_stages_after_draw() {
        let (mut graph, registry) = graph("r = 1; g = 0.5; b = 0", 4, 4);
        let handle = registry.add_stage(StageConfig::new(2, 1)).unwrap();
        assert!(!handle.is_ready());

        graph.tick(&InputFrame::default()).unwrap();
        let snapshot = handle.reader().try_read().unwrap();
        assert_eq!(snapshot.data(), &[255, 128, 0, 255, 128, 0]);
    }

    #[test]
    fn resize_recreates_canvas_between_frames() {
        let (mut graph, registry) = graph("r = 1; g = 1; b = 1", 4, 4);
        registry.resize_canvas(8, 2).unwrap();
        graph.tick(&InputFrame::default()).unwrap();
        assert_eq!((graph.canvas().width(), graph.canvas().height()), (8, 2));
        assert_eq!(graph.canvas().pixel(7, 1), Some([255, 255, 255]));
    }

    #[test]
    fn program_swap_takes_effect_next_tick() {
        let (mut graph, registry) = graph("r = 1; g = 0; b = 0", 2, 2);
        let handle = registry.add_stage(StageConfig::new(1, 1)).unwrap();
        graph.tick(&InputFrame::default()).unwrap();
        assert_eq!(handle.reader().try_read().unwrap().data(), &[255, 0, 0]);

        registry
            .load_program("a = 0.5; c = a * 2; r = 0; g = c; b = a")
            .unwrap();
        assert!(registry.load_program("r = nope; g = 0; b = 0").is_err());
        graph.tick(&InputFrame::default()).unwrap();
        assert_eq!(handle.reader().try_read().unwrap().data(), &[0, 255, 128]);
    }

    #[test]
    fn surface_sees_every_frame() {
        let (mut graph, _registry) = graph("r = 0; g = 0; b = 0", 1, 1);
        let count = Arc::new(Mutex::new(0));
        graph.attach_surface(Box::new(CountingSurface(count.clone())));
        for _ in 0..3 {
            graph.tick(&InputFrame::default()).unwrap();
        }
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn render_thread_serves_registered_stages() {
        let config = RendererConfig {
            width: 8,
            height: 8,
            framerate: 200.0,
            ..Default::default()
        };
        let inputs = Arc::new(RenderInputs::new(config.spectrum_len));
        let program = Program::compile("r = 0.2; g = 0.4; b = 0.6").unwrap();
        let (mut renderer, registry) = Renderer::start(&config, program, inputs, None).unwrap();

        let handle = registry.add_stage(StageConfig::new(2, 2)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_ready() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(handle.is_ready());
        assert_eq!(&handle.reader().try_read().unwrap().data()[..3], &[51, 102, 153]);

        assert!(renderer.is_running());
        assert!(renderer.stop() > 0);
        assert!(!renderer.is_running());
        assert!(matches!(
            registry.add_stage(StageConfig::new(1, 1)).unwrap_err(),
            LedWallError::Shutdown
        ));
        // snapshot outlives the render thread
        assert!(handle.reader().try_read().is_some());
    }
}
