use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    mapping::WiringConfig,
    scene::SceneDescriptor,
    stage::{FilterMode, SourceRect, StageConfig},
    timeline::tick_interval,
    LedWallError, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub renderer: RendererConfig,
    pub canvas_size: PhysicalSize,
    pub audio: AudioConfig,
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.renderer.validate()?;
        self.canvas_size.validate("canvas")?;
        for device in &self.devices {
            device.validate()?;
        }
        for (i, device) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|other| other.name == device.name) {
                return Err(LedWallError::invalid(format!(
                    "device name `{}` is used more than once",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of the canvas renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: f32,
    pub spectrum_len: usize,
    pub scene: SceneDescriptor,
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LedWallError::invalid(format!(
                "canvas resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        tick_interval(self.framerate).map_err(|_| {
            LedWallError::invalid(format!(
                "renderer framerate must be a usable positive rate, got {}",
                self.framerate
            ))
        })?;
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            framerate: 60.0,
            spectrum_len: 64,
            scene: SceneDescriptor::live_demo(),
        }
    }
}

/// Physical extent in length units (metres by convention).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSize {
    pub width: f32,
    pub height: f32,
}

impl PhysicalSize {
    fn validate(&self, what: &str) -> Result<()> {
        let ok = self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0;
        if !ok {
            return Err(LedWallError::invalid(format!(
                "{what} physical size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl Default for PhysicalSize {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Analysis updates per second.
    pub analysis_rate: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            analysis_rate: 60.0,
        }
    }
}

/// One physical LED panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub width_px: u32,
    pub height_px: u32,
    /// Physical extent of the panel.
    pub size: PhysicalSize,
    /// Position of the panel's bottom-left corner on the physical canvas.
    #[serde(default)]
    pub offset_x: f32,
    #[serde(default)]
    pub offset_y: f32,
    #[serde(default = "default_rate")]
    pub rate_hz: f32,
    #[serde(default)]
    pub wiring: WiringConfig,
    #[serde(default)]
    pub filter: FilterMode,
    /// Transport destination, e.g. `192.168.1.40:6454`.
    pub target: String,
}

fn default_rate() -> f32 {
    60.0
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width_px == 0 || self.height_px == 0 {
            return Err(LedWallError::invalid(format!(
                "device `{}` needs a non-zero pixel size, got {}x{}",
                self.name, self.width_px, self.height_px
            )));
        }
        self.size.validate(&format!("device `{}`", self.name))?;
        if !self.offset_x.is_finite() || !self.offset_y.is_finite() {
            return Err(LedWallError::invalid(format!(
                "device `{}` has a non-finite offset",
                self.name
            )));
        }
        tick_interval(self.rate_hz).map_err(|_| {
            LedWallError::invalid(format!(
                "device `{}` transmit rate must be a usable positive rate, got {}",
                self.name, self.rate_hz
            ))
        })?;
        Ok(())
    }

    /// Stage that feeds this device: its pixel resolution over the canvas
    /// region its physical placement covers.
    pub fn stage_config(&self, canvas: &PhysicalSize) -> Result<StageConfig> {
        self.validate()?;
        canvas.validate("canvas")?;
        let rect = SourceRect {
            offset_x: self.offset_x / canvas.width,
            offset_y: self.offset_y / canvas.height,
            size_x: self.size.width / canvas.width,
            size_y: self.size.height / canvas.height,
        };
        let config = StageConfig::new(self.width_px, self.height_px)
            .with_rect(rect)
            .with_filter(self.filter);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{ScanAxis, StartX, StartY};

    const SAMPLE: &str = r#"{
        "renderer": { "width": 64, "height": 32, "scene": { "name": "p", "program": { "preset": "plasma" } } },
        "canvas_size": { "width": 2.0, "height": 1.0 },
        "devices": [
            {
                "name": "left",
                "width_px": 10,
                "height_px": 5,
                "size": { "width": 1.0, "height": 0.5 },
                "offset_x": 1.0,
                "offset_y": 0.25,
                "rate_hz": 30,
                "wiring": { "serpentine": true, "axis": "vertical", "start_x": "right", "start_y": "top" },
                "filter": "linear",
                "target": "127.0.0.1:6454"
            }
        ]
    }"#;

    #[test]
    fn loads_partial_config_with_defaults() {
        let config = AppConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.renderer.width, 64);
        assert_eq!(config.renderer.framerate, 60.0);
        assert_eq!(config.audio, AudioConfig::default());

        let device = &config.devices[0];
        assert_eq!(
            device.wiring,
            WiringConfig {
                serpentine: true,
                axis: ScanAxis::Vertical,
                start_x: StartX::Right,
                start_y: StartY::Top,
            }
        );
        assert_eq!(device.filter, FilterMode::Linear);
    }

    #[test]
    fn device_rect_follows_physical_placement() {
        let config = AppConfig::from_json(SAMPLE).unwrap();
        let stage = config.devices[0].stage_config(&config.canvas_size).unwrap();
        assert_eq!((stage.width, stage.height), (10, 5));
        assert_eq!(
            stage.rect,
            SourceRect {
                offset_x: 0.5,
                offset_y: 0.25,
                size_x: 0.5,
                size_y: 0.5,
            }
        );
        assert_eq!(stage.filter, FilterMode::Linear);
    }

    #[test]
    fn rejects_invalid_devices() {
        let zero = SAMPLE.replace("\"width_px\": 10", "\"width_px\": 0");
        assert!(matches!(
            AppConfig::from_json(&zero).unwrap_err(),
            LedWallError::InvalidConfiguration(_)
        ));

        let mut config = AppConfig::from_json(SAMPLE).unwrap();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_rates_too_small_to_pace() {
        let tiny = SAMPLE.replace("\"rate_hz\": 30", "\"rate_hz\": 1e-20");
        assert!(matches!(
            AppConfig::from_json(&tiny).unwrap_err(),
            LedWallError::InvalidConfiguration(_)
        ));

        let mut config = AppConfig::live_defaults();
        config.renderer.framerate = 1e-20;
        assert!(matches!(
            config.validate().unwrap_err(),
            LedWallError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn default_config_round_trips() {
        let config = AppConfig::live_defaults();
        let parsed = AppConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
