//! Reference producers for the renderer's audio inputs: spectrum reduction
//! and beat detection.

use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{LedWallError, Result};

/// Bands summed into the bass level used for beat detection.
const BASS_BANDS: usize = 4;
/// Short-window average must exceed the long-window one by this factor.
const BEAT_RATIO: f32 = 1.5;
const LONG_WINDOW_SECONDS: f32 = 5.0;
const SHORT_WINDOW_FRACTION: f32 = 1.0 / 6.0;

/// Reduces sample blocks to a fixed number of log-spaced magnitude bands.
pub struct SpectrumReducer {
    bands: usize,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl SpectrumReducer {
    pub fn new(bands: usize) -> Self {
        Self {
            bands,
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    /// Windows and transforms `samples`, writing one magnitude per band.
    pub fn reduce(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() < 2 {
            return Err(LedWallError::msg(
                "spectrum reduction requires blocks with at least two samples",
            ));
        }

        let len = samples.len();
        let bands = self.bands;
        let fft = self.prepare_fft(len);
        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| LedWallError::msg(format!("fft failed: {err}")))?;

        let bins = fft.spectrum.len();
        let scale = 2.0 / len as f32;
        let edges = band_edges(bands, bins);
        let mut out = vec![0.0; bands];
        for (value, range) in out.iter_mut().zip(edges.windows(2)) {
            let (start, end) = (range[0], range[1]);
            if start < end {
                let sum: f32 = fft.spectrum[start..end].iter().map(|bin| bin.norm()).sum();
                *value = sum * scale / (end - start) as f32;
            }
        }
        Ok(out)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().map(|fft| fft.size != size).unwrap_or(false) {
            self.fft = None;
        }

        let planner = &mut self.planner;
        self.fft.get_or_insert_with(|| {
            let plan = planner.plan_fft_forward(size);
            FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
            }
        })
    }
}

/// Log-spaced band edges over the FFT bins, skipping the DC bin. Edges are
/// strictly increasing until they reach `bins`.
fn band_edges(bands: usize, bins: usize) -> Vec<usize> {
    let mut edges = Vec::with_capacity(bands + 1);
    edges.push(1.min(bins - 1));
    for i in 1..=bands {
        let log_edge = (bins as f32).powf(i as f32 / bands as f32).round() as usize;
        let prev = edges[i - 1];
        edges.push(log_edge.max(prev + 1).min(bins));
    }
    edges
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumReducer")
            .field("bands", &self.bands)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

/// Detects beats as sudden rises of the bass level above its recent average.
#[derive(Debug, Clone)]
pub struct BeatDetector {
    long: VecDeque<f32>,
    long_len: usize,
    short: VecDeque<f32>,
    short_len: usize,
    armed: bool,
}

impl BeatDetector {
    /// `rate` is the number of spectrum frames fed per second.
    pub fn new(rate: f32) -> Self {
        let rate = if rate.is_finite() { rate.max(1.0) } else { 60.0 };
        let long_len = (rate * LONG_WINDOW_SECONDS).round().max(1.0) as usize;
        let short_len = (rate * SHORT_WINDOW_FRACTION).round().max(1.0) as usize;
        Self {
            long: VecDeque::with_capacity(long_len),
            long_len,
            short: VecDeque::with_capacity(short_len),
            short_len,
            armed: true,
        }
    }

    /// Feeds one spectrum frame. Returns true on the frame a beat starts.
    pub fn process(&mut self, spectrum: &[f32]) -> bool {
        let bass: f32 = spectrum.iter().take(BASS_BANDS).sum();
        push_bounded(&mut self.long, self.long_len, bass);
        push_bounded(&mut self.short, self.short_len, bass);

        if average(&self.short) > average(&self.long) * BEAT_RATIO {
            if self.armed {
                self.armed = false;
                return true;
            }
        } else {
            self.armed = true;
        }
        false
    }
}

fn push_bounded(window: &mut VecDeque<f32>, len: usize, value: f32) {
    if window.len() >= len {
        window.pop_front();
    }
    window.push_back(value);
}

fn average(window: &VecDeque<f32>) -> f32 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f32>() / window.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_reduces_to_zero() {
        let mut reducer = SpectrumReducer::new(16);
        let bands = reducer.reduce(&[0.0; 1024]).unwrap();
        assert_eq!(bands.len(), 16);
        assert!(bands.iter().all(|b| *b == 0.0));
    }

    #[test]
    fn low_tone_lands_in_low_bands() {
        let mut reducer = SpectrumReducer::new(16);
        let low = reducer.reduce(&sine(100.0, 48_000.0, 1024)).unwrap();
        let high = reducer.reduce(&sine(12_000.0, 48_000.0, 1024)).unwrap();

        let peak = |bands: &[f32]| {
            bands
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap()
        };
        assert!(peak(&low) < peak(&high));
    }

    #[test]
    fn rejects_tiny_blocks() {
        let mut reducer = SpectrumReducer::new(4);
        assert!(reducer.reduce(&[1.0]).is_err());
    }

    #[test]
    fn band_edges_cover_spectrum_in_order() {
        let bins = 513;
        let edges = band_edges(32, bins);
        assert_eq!(edges.len(), 33);
        assert_eq!(edges[0], 1);
        assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(edges[32], bins);
    }

    #[test]
    fn detects_bass_onsets_once() {
        let mut detector = BeatDetector::new(60.0);
        let quiet = [0.1, 0.1, 0.1, 0.1];
        let loud = [1.0, 1.0, 1.0, 1.0];

        for _ in 0..120 {
            assert!(!detector.process(&quiet));
        }
        let beats = (0..5).filter(|_| detector.process(&loud)).count();
        assert_eq!(beats, 1);

        for _ in 0..60 {
            detector.process(&quiet);
        }
        assert!((0..5).any(|_| detector.process(&loud)));
    }
}
