use std::f32::consts::PI;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};

use crate::{
    analysis::{BeatDetector, SpectrumReducer},
    config::AudioConfig,
    inputs::RenderInputs,
    timeline::FramePacer,
    LedWallError, Result,
};

/// Anything that can hand out blocks of mono samples.
pub trait SampleSource: Send + 'static {
    fn fill(&mut self, block: &mut [f32]) -> Result<()>;
}

/// Synthetic signal: a decaying bass kick on every beat over a quiet tone.
/// Used when no capture device is wired up.
#[derive(Debug, Clone)]
pub struct TestTone {
    sample_rate: f32,
    beat_interval: f32,
    time: f32,
}

impl TestTone {
    pub fn new(sample_rate: u32, bpm: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as f32,
            beat_interval: 60.0 / bpm.max(1.0),
            time: 0.0,
        }
    }
}

impl SampleSource for TestTone {
    fn fill(&mut self, block: &mut [f32]) -> Result<()> {
        let step = 1.0 / self.sample_rate;
        for sample in block.iter_mut() {
            let since_beat = self.time % self.beat_interval;
            let kick = (2.0 * PI * 60.0 * self.time).sin() * (-since_beat * 12.0).exp();
            let tone = (2.0 * PI * 440.0 * self.time).sin() * 0.05;
            *sample = kick + tone;
            self.time += step;
        }
        Ok(())
    }
}

/// Spectrum reduction and beat detection feeding [`RenderInputs`].
#[derive(Debug)]
pub struct AudioAnalysis {
    reducer: SpectrumReducer,
    detector: BeatDetector,
}

impl AudioAnalysis {
    pub fn new(bands: usize, rate: f32) -> Self {
        Self {
            reducer: SpectrumReducer::new(bands),
            detector: BeatDetector::new(rate),
        }
    }

    /// Analyses one block and pushes the results. Returns whether a beat was
    /// detected.
    pub fn process_block(&mut self, samples: &[f32], inputs: &RenderInputs) -> Result<bool> {
        let spectrum = self.reducer.reduce(samples)?;
        inputs.set_spectrum(&spectrum)?;
        let beat = self.detector.process(&spectrum);
        if beat {
            inputs.notify_beat()?;
        }
        Ok(beat)
    }
}

/// Background thread pulling blocks from a [`SampleSource`] at the analysis
/// rate.
#[derive(Debug)]
pub struct AudioPump {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPump {
    pub fn start<S: SampleSource>(
        mut source: S,
        config: &AudioConfig,
        inputs: Arc<RenderInputs>,
    ) -> Result<Self> {
        if config.block_size < 2 {
            return Err(LedWallError::invalid(format!(
                "audio block size must be at least 2, got {}",
                config.block_size
            )));
        }
        let mut pacer = FramePacer::new(config.analysis_rate)?;
        let mut analysis = AudioAnalysis::new(inputs.spectrum_len(), config.analysis_rate);
        let mut block = vec![0.0; config.block_size];
        let (stop_tx, stop_rx) = bounded(1);

        let thread = thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || {
                info!("audio analysis started");
                loop {
                    let result = source
                        .fill(&mut block)
                        .and_then(|_| analysis.process_block(&block, &inputs));
                    match result {
                        Ok(true) => debug!("beat detected"),
                        Ok(false) => {}
                        Err(err) => warn!(error = %err, "audio analysis failed"),
                    }
                    if !pacer.wait_or_stop(&stop_rx) {
                        break;
                    }
                }
                info!("audio analysis stopped");
            })
            .map_err(|err| LedWallError::msg(format!("failed to spawn audio thread: {err}")))?;

        Ok(Self {
            stop_tx,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop_tx.try_send(());
            let _ = thread.join();
        }
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        self.stop();
    }
}
