use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{program::Program, LedWallError, Result};

/// Built-in image programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneKind {
    Spectrum,
    Plasma,
    BeatPulse,
    AlbumArt,
}

impl SceneKind {
    pub const ALL: [SceneKind; 4] = [
        SceneKind::Spectrum,
        SceneKind::Plasma,
        SceneKind::BeatPulse,
        SceneKind::AlbumArt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Spectrum => "spectrum",
            Self::Plasma => "plasma",
            Self::BeatPulse => "beat_pulse",
            Self::AlbumArt => "album_art",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn source(self) -> &'static str {
        match self {
            Self::Spectrum => SPECTRUM,
            Self::Plasma => PLASMA,
            Self::BeatPulse => BEAT_PULSE,
            Self::AlbumArt => ALBUM_ART,
        }
    }
}

const SPECTRUM: &str = "
band = spectrum(x);
lit = step(y, band * 4);
pulse = clamp(1 - last_beat / 300, 0, 1);
r = lit * (0.2 + 0.8 * x) + pulse * 0.2;
g = lit * (1 - x) * 0.8;
b = lit * 0.6 + pulse * 0.3;
";

const PLASMA: &str = "
t = time * 0.001;
v = sin(x * 10 + t) + sin(y * 10 + t * 1.3) + sin((x + y) * 7 + t * 0.7) + spectrum(0.05) * 4;
r = 0.5 + 0.5 * sin(v * pi);
g = 0.5 + 0.5 * sin(v * pi + 2.094);
b = 0.5 + 0.5 * sin(v * pi + 4.188);
";

const BEAT_PULSE: &str = "
pulse = exp(-last_beat / 180);
d = sqrt((x - mouse_x) ^ 2 + (y - mouse_y) ^ 2);
ring = smoothstep(0.08, 0, abs(d - pulse * 0.7));
r = ring + pulse * 0.3;
g = ring * 0.4;
b = ring * (0.5 + spectrum(0.5) * 2);
";

const ALBUM_ART: &str = "
shade = 0.6 + 0.4 * playing;
bar = (y < 0.03) * (x <= progress);
r = art_r(x, y) * shade + bar;
g = art_g(x, y) * shade + bar;
b = art_b(x, y) * shade + bar;
";

/// Where the canvas program comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramSource {
    Preset(SceneKind),
    Inline(String),
    File(PathBuf),
}

/// Named canvas scene, compiled into a [`Program`] when the renderer loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub name: String,
    pub program: ProgramSource,
}

impl SceneDescriptor {
    pub fn live_demo() -> Self {
        Self::preset(SceneKind::Spectrum)
    }

    pub fn preset(kind: SceneKind) -> Self {
        Self {
            name: kind.name().to_string(),
            program: ProgramSource::Preset(kind),
        }
    }

    /// Reads the program text for this scene.
    pub fn source(&self) -> Result<String> {
        match &self.program {
            ProgramSource::Preset(kind) => Ok(kind.source().to_string()),
            ProgramSource::Inline(source) => Ok(source.clone()),
            ProgramSource::File(path) => std::fs::read_to_string(path).map_err(|err| {
                LedWallError::msg(format!(
                    "cannot read program `{}`: {err}",
                    path.display()
                ))
            }),
        }
    }

    pub fn compile(&self) -> Result<Program> {
        let source = self.source()?;
        Program::compile(&source)
    }
}

impl Default for SceneDescriptor {
    fn default() -> Self {
        Self::live_demo()
    }
}
