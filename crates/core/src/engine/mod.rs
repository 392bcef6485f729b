//! The running pipeline as one owned value.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::{AppConfig, DeviceConfig},
    inputs::RenderInputs,
    output::{DeviceScheduler, SchedulerState, SchedulerStats},
    registry::{StageHandle, StageRegistry},
    render::Renderer,
    scene::SceneDescriptor,
    transport::Transport,
    LedWallError, Result,
};

struct DeviceOutput {
    config: DeviceConfig,
    stage: StageHandle,
    scheduler: DeviceScheduler,
}

/// Owns the render thread, its inputs and registry, and every device
/// output. Dropping the engine shuts it down.
pub struct Engine {
    config: AppConfig,
    inputs: Arc<RenderInputs>,
    renderer: Renderer,
    registry: StageRegistry,
    devices: Vec<DeviceOutput>,
}

impl Engine {
    /// Compiles the scene, starts the renderer and brings up every configured
    /// device. `connect` opens the transport for each device.
    pub fn start<F>(config: &AppConfig, mut connect: F) -> Result<Self>
    where
        F: FnMut(&DeviceConfig) -> Result<Box<dyn Transport>>,
    {
        config.validate()?;
        let program = config.renderer.scene.compile()?;
        let inputs = Arc::new(RenderInputs::new(config.renderer.spectrum_len));
        let (renderer, registry) = Renderer::start(&config.renderer, program, inputs.clone(), None)?;

        let mut engine = Self {
            config: config.clone(),
            inputs,
            renderer,
            registry,
            devices: Vec::with_capacity(config.devices.len()),
        };
        for device in &config.devices {
            let transport = connect(device)?;
            engine.add_device(device.clone(), transport)?;
        }

        info!(
            scene = %config.renderer.scene.name,
            devices = engine.devices.len(),
            "engine started"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn inputs(&self) -> &Arc<RenderInputs> {
        &self.inputs
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.renderer.is_running()
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.devices.iter().map(|device| device.config.name.as_str())
    }

    /// Switches the running scene. The program is compiled here; on failure
    /// the current scene keeps rendering.
    pub fn set_scene(&mut self, scene: SceneDescriptor) -> Result<()> {
        let program = scene.compile()?;
        self.registry.set_program(program)?;
        info!(scene = %scene.name, "scene switched");
        self.config.renderer.scene = scene;
        Ok(())
    }

    /// Registers a stage for the device and starts its output loop.
    pub fn add_device(&mut self, device: DeviceConfig, transport: Box<dyn Transport>) -> Result<()> {
        if self.find(&device.name).is_some() {
            return Err(LedWallError::invalid(format!(
                "device `{}` is already running",
                device.name
            )));
        }
        let stage_config = device.stage_config(&self.config.canvas_size)?;
        let stage = self.registry.add_stage(stage_config)?;

        let scheduler = DeviceScheduler::new(device.name.clone());
        let started = scheduler
            .configure(&device, stage.reader().clone())
            .and_then(|_| scheduler.start(transport));
        if let Err(err) = started {
            if let Err(remove_err) = self.registry.remove_stage(stage.id()) {
                warn!(stage = %stage.id(), error = %remove_err, "could not release stage");
            }
            return Err(err);
        }

        info!(device = %device.name, stage = %stage.id(), target = %device.target, "device added");
        self.devices.push(DeviceOutput {
            config: device,
            stage,
            scheduler,
        });
        Ok(())
    }

    /// Stops a device's output and removes its stage. Returns false when no
    /// device has that name.
    pub fn remove_device(&mut self, name: &str) -> Result<bool> {
        let Some(index) = self.find(name) else {
            return Ok(false);
        };
        let device = self.devices.remove(index);
        device.scheduler.stop();
        self.registry.remove_stage(device.stage.id())?;
        info!(device = %name, stage = %device.stage.id(), "device removed");
        Ok(true)
    }

    pub fn stage(&self, name: &str) -> Option<&StageHandle> {
        self.find(name).map(|index| &self.devices[index].stage)
    }

    pub fn device_state(&self, name: &str) -> Option<SchedulerState> {
        self.find(name)
            .map(|index| self.devices[index].scheduler.state())
    }

    pub fn device_stats(&self, name: &str) -> Option<SchedulerStats> {
        self.find(name)
            .map(|index| self.devices[index].scheduler.stats())
    }

    /// Stops every device, then the renderer. Returns the number of frames
    /// rendered.
    pub fn shutdown(mut self) -> u64 {
        self.halt()
    }

    fn halt(&mut self) -> u64 {
        for device in &self.devices {
            device.scheduler.stop();
        }
        self.devices.clear();
        let frames = self.renderer.stop();
        if frames > 0 {
            info!(frames, "engine stopped");
        }
        frames
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.devices
            .iter()
            .position(|device| device.config.name == name)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.halt();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("renderer", &self.renderer)
            .field("devices", &self.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PhysicalSize,
        mapping::WiringConfig,
        scene::{ProgramSource, SceneDescriptor},
        stage::FilterMode,
        transport::MemoryTransport,
    };
    use std::thread;
    use std::time::{Duration, Instant};

    fn config(program: &str) -> AppConfig {
        let mut config = AppConfig::live_defaults();
        config.renderer.width = 16;
        config.renderer.height = 16;
        config.renderer.framerate = 120.0;
        config.renderer.scene = SceneDescriptor {
            name: "test".to_string(),
            program: ProgramSource::Inline(program.to_string()),
        };
        config
    }

    fn device(name: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            width_px: 4,
            height_px: 2,
            size: PhysicalSize::default(),
            offset_x: 0.0,
            offset_y: 0.0,
            rate_hz: 200.0,
            wiring: WiringConfig::default(),
            filter: FilterMode::Nearest,
            target: "127.0.0.1:6454".to_string(),
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn bad_program_fails_before_anything_starts() {
        let mut connects = 0;
        let err = Engine::start(&config("r = 1; g = ;"), |_| {
            connects += 1;
            Ok(Box::new(MemoryTransport::default()) as Box<dyn Transport>)
        })
        .unwrap_err();
        assert!(matches!(err, LedWallError::ProgramBuild { .. }));
        assert_eq!(connects, 0);
    }

    #[test]
    fn devices_receive_program_output() {
        let mut config = config("r = 1; g = 0; b = 0.2;");
        config.devices.push(device("front"));
        let (transport, log) = MemoryTransport::new();

        let engine = Engine::start(&config, |_| Ok(Box::new(transport.clone()) as Box<dyn Transport>))
            .unwrap();
        assert!(wait_for(|| !log.is_empty()));
        assert_eq!(engine.device_state("front"), Some(SchedulerState::Running));

        let frame = log.last().unwrap();
        assert_eq!(frame.len(), 4 * 2 * 3);
        assert!(frame.chunks(3).all(|rgb| rgb == [255, 0, 51]));

        assert!(engine.shutdown() > 0);
    }

    #[test]
    fn scene_switch_changes_device_output() {
        let mut config = config("r = 1; g = 0; b = 0;");
        config.devices.push(device("front"));
        let (transport, log) = MemoryTransport::new();
        let mut engine =
            Engine::start(&config, |_| Ok(Box::new(transport.clone()) as Box<dyn Transport>))
                .unwrap();
        assert!(wait_for(|| log.last().map_or(false, |frame| frame[..3] == [255, 0, 0])));

        let broken = SceneDescriptor {
            name: "broken".to_string(),
            program: ProgramSource::Inline("r = 1 +;".to_string()),
        };
        assert!(matches!(
            engine.set_scene(broken).unwrap_err(),
            LedWallError::ProgramBuild { .. }
        ));
        assert_eq!(engine.config().renderer.scene.name, "test");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(&log.last().unwrap()[..3], &[255, 0, 0]);

        let blue = SceneDescriptor {
            name: "blue".to_string(),
            program: ProgramSource::Inline("r = 0; g = 0; b = 1;".to_string()),
        };
        engine.set_scene(blue).unwrap();
        assert!(wait_for(|| log.last().map_or(false, |frame| frame[..3] == [0, 0, 255])));
        assert_eq!(engine.config().renderer.scene.name, "blue");
    }

    #[test]
    fn adds_and_removes_devices_at_runtime() {
        let mut engine = Engine::start(&config("r = x; g = y; b = 0;"), |_| {
            Ok(Box::new(MemoryTransport::default()) as Box<dyn Transport>)
        })
        .unwrap();

        let (transport, log) = MemoryTransport::new();
        engine.add_device(device("side"), Box::new(transport)).unwrap();
        assert!(engine
            .add_device(device("side"), Box::new(MemoryTransport::default()))
            .is_err());
        assert!(wait_for(|| log.len() > 2));

        let reader = engine.stage("side").unwrap().reader().clone();
        assert!(engine.remove_device("side").unwrap());
        assert!(!engine.remove_device("side").unwrap());
        assert_eq!(engine.device_names().count(), 0);

        // the last snapshot outlives the stage
        thread::sleep(Duration::from_millis(30));
        let snapshot = reader.try_read().unwrap();
        assert_eq!(snapshot.data().len(), 4 * 2 * 3);

        let sent = log.len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(log.len(), sent);
    }
}
