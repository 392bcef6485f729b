use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::{mapping::BYTES_PER_PIXEL, LedWallError, Result};

/// RGB image supplied by a media integration, rows stored top-down.
#[derive(Clone, PartialEq, Eq)]
pub struct AlbumArt {
    width: u32,
    height: u32,
    pixels: Box<[u8]>,
}

impl AlbumArt {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(LedWallError::invalid(format!(
                "album art of {width}x{height} expects {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels: pixels.into_boxed_slice(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Nearest-neighbour lookup at normalized `(u, v)` with `v = 0` at the
    /// bottom edge. Returns channels in `[0, 1]`.
    pub fn sample(&self, u: f32, v: f32) -> [f32; 3] {
        let w = self.width as usize;
        let h = self.height as usize;
        let col = ((u.clamp(0.0, 1.0) * w as f32) as usize).min(w - 1);
        let row = (((1.0 - v.clamp(0.0, 1.0)) * h as f32) as usize).min(h - 1);
        let start = (row * w + col) * BYTES_PER_PIXEL;
        let px = &self.pixels[start..start + BYTES_PER_PIXEL];
        [
            px[0] as f32 / 255.0,
            px[1] as f32 / 255.0,
            px[2] as f32 / 255.0,
        ]
    }
}

impl fmt::Debug for AlbumArt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlbumArt")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Consistent copy of every renderer input, taken once per tick.
#[derive(Debug, Clone, Default)]
pub struct InputFrame {
    /// Milliseconds since the inputs were created.
    pub time_ms: f32,
    /// Normalized pointer position.
    pub mouse: [f32; 2],
    pub last_beat_ms: f32,
    pub last_mouse_ms: f32,
    pub progress: f32,
    pub playing: bool,
    pub spectrum: Vec<f32>,
    pub album_art: Option<Arc<AlbumArt>>,
}

impl InputFrame {
    /// Linearly interpolates the spectrum at normalized position `t`.
    pub fn sample_spectrum(&self, t: f32) -> f32 {
        let n = self.spectrum.len();
        if n == 0 {
            return 0.0;
        }
        let pos = t.clamp(0.0, 1.0) * (n - 1) as f32;
        let lower = (pos.floor() as usize).min(n - 1);
        let upper = (lower + 1).min(n - 1);
        let frac = pos - lower as f32;
        self.spectrum[lower] + (self.spectrum[upper] - self.spectrum[lower]) * frac
    }

    pub fn sample_art(&self, u: f32, v: f32) -> [f32; 3] {
        self.album_art
            .as_ref()
            .map(|art| art.sample(u, v))
            .unwrap_or([0.0; 3])
    }
}

#[derive(Debug)]
struct InputState {
    spectrum: Vec<f32>,
    mouse: [f32; 2],
    last_beat: Instant,
    last_mouse: Instant,
    progress: f32,
    playing: bool,
    album_art: Option<Arc<AlbumArt>>,
}

/// Thread-safe input surface that audio, beat and media collaborators update
/// and the renderer samples.
#[derive(Debug)]
pub struct RenderInputs {
    started: Instant,
    spectrum_len: usize,
    state: Mutex<InputState>,
}

impl RenderInputs {
    pub fn new(spectrum_len: usize) -> Self {
        let started = Instant::now();
        Self {
            started,
            spectrum_len,
            state: Mutex::new(InputState {
                spectrum: vec![0.0; spectrum_len],
                mouse: [0.5, 0.5],
                last_beat: started,
                last_mouse: started,
                progress: 0.0,
                playing: false,
                album_art: None,
            }),
        }
    }

    pub fn spectrum_len(&self) -> usize {
        self.spectrum_len
    }

    /// Replaces the spectrum. Short input is zero-filled, long input truncated.
    pub fn set_spectrum(&self, values: &[f32]) -> Result<()> {
        let mut state = self.lock()?;
        let take = values.len().min(self.spectrum_len);
        state.spectrum[..take].copy_from_slice(&values[..take]);
        state.spectrum[take..].fill(0.0);
        Ok(())
    }

    pub fn notify_beat(&self) -> Result<()> {
        self.lock()?.last_beat = Instant::now();
        Ok(())
    }

    pub fn set_playback_state(&self, progress: f32, playing: bool) -> Result<()> {
        let mut state = self.lock()?;
        state.progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        state.playing = playing;
        Ok(())
    }

    pub fn set_album_art(&self, art: Option<AlbumArt>) -> Result<()> {
        self.lock()?.album_art = art.map(Arc::new);
        Ok(())
    }

    /// Moves the pointer to normalized `(x, y)`.
    pub fn set_pointer(&self, x: f32, y: f32) -> Result<()> {
        let mut state = self.lock()?;
        state.mouse = [x, y];
        state.last_mouse = Instant::now();
        Ok(())
    }

    /// Takes a consistent copy of the inputs as seen at `now`.
    pub fn frame_at(&self, now: Instant) -> Result<InputFrame> {
        let state = self.lock()?;
        let millis = |since: Instant| now.saturating_duration_since(since).as_secs_f32() * 1000.0;
        Ok(InputFrame {
            time_ms: millis(self.started),
            mouse: state.mouse,
            last_beat_ms: millis(state.last_beat),
            last_mouse_ms: millis(state.last_mouse),
            progress: state.progress,
            playing: state.playing,
            spectrum: state.spectrum.clone(),
            album_art: state.album_art.clone(),
        })
    }

    pub fn frame(&self) -> Result<InputFrame> {
        self.frame_at(Instant::now())
    }

    fn lock(&self) -> Result<MutexGuard<'_, InputState>> {
        self.state
            .lock()
            .map_err(|_| LedWallError::msg("render inputs have been poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spectrum_is_fixed_length() {
        let inputs = RenderInputs::new(4);
        inputs.set_spectrum(&[1.0, 2.0]).unwrap();
        assert_eq!(inputs.frame().unwrap().spectrum, vec![1.0, 2.0, 0.0, 0.0]);

        inputs.set_spectrum(&[5.0; 10]).unwrap();
        assert_eq!(inputs.frame().unwrap().spectrum, vec![5.0; 4]);
    }

    #[test]
    fn beat_resets_elapsed_time() {
        let inputs = RenderInputs::new(1);
        let later = Instant::now() + Duration::from_millis(500);
        assert!(inputs.frame_at(later).unwrap().last_beat_ms >= 500.0);

        inputs.notify_beat().unwrap();
        let frame = inputs.frame().unwrap();
        assert!(frame.last_beat_ms < 500.0);
    }

    #[test]
    fn playback_state_is_clamped() {
        let inputs = RenderInputs::new(1);
        inputs.set_playback_state(1.5, true).unwrap();
        let frame = inputs.frame().unwrap();
        assert_eq!(frame.progress, 1.0);
        assert!(frame.playing);
    }

    #[test]
    fn spectrum_sampling_interpolates() {
        let frame = InputFrame {
            spectrum: vec![0.0, 1.0],
            ..Default::default()
        };
        assert_eq!(frame.sample_spectrum(0.0), 0.0);
        assert!((frame.sample_spectrum(0.25) - 0.25).abs() < 1e-6);
        assert_eq!(frame.sample_spectrum(2.0), 1.0);
        assert_eq!(InputFrame::default().sample_spectrum(0.5), 0.0);
    }

    #[test]
    fn album_art_validates_and_samples() {
        assert!(AlbumArt::new(2, 2, vec![0; 5]).is_err());

        // top row red, bottom row blue
        let art = AlbumArt::new(1, 2, vec![255, 0, 0, 0, 0, 255]).unwrap();
        assert_eq!(art.sample(0.5, 0.9), [1.0, 0.0, 0.0]);
        assert_eq!(art.sample(0.5, 0.1), [0.0, 0.0, 1.0]);
    }
}
