//! Per-device output scheduling.
//!
//! Each [`DeviceScheduler`] runs two threads: a tick thread that reads the
//! latest snapshot of its stage at the device's own rate and repacks it into
//! wiring order, and a transport thread that performs the actual send. The
//! two are joined by a single-slot channel, so a slow transport costs dropped
//! frames instead of late ticks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::{
    config::DeviceConfig,
    mapping::AddressingTable,
    snapshot::SnapshotReader,
    timeline::FramePacer,
    transport::Transport,
    LedWallError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Configured,
    Running,
    Stopped,
}

/// Counters describing what a scheduler has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Ticks skipped because the stage had not published yet.
    pub not_ready: u64,
    /// Buffers handed to the transport thread.
    pub queued: u64,
    /// Queued buffers whose snapshot version matched the previous one.
    pub repeated: u64,
    /// Ticks skipped because the transport was still busy.
    pub dropped_busy: u64,
    pub transmitted: u64,
    pub transport_errors: u64,
    pub last_version: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    not_ready: AtomicU64,
    queued: AtomicU64,
    repeated: AtomicU64,
    dropped_busy: AtomicU64,
    transmitted: AtomicU64,
    transport_errors: AtomicU64,
    last_version: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot(&self) -> SchedulerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SchedulerStats {
            ticks: load(&self.ticks),
            not_ready: load(&self.not_ready),
            queued: load(&self.queued),
            repeated: load(&self.repeated),
            dropped_busy: load(&self.dropped_busy),
            transmitted: load(&self.transmitted),
            transport_errors: load(&self.transport_errors),
            last_version: load(&self.last_version),
        }
    }
}

struct Binding {
    table: Arc<AddressingTable>,
    reader: SnapshotReader,
    rate_hz: f32,
}

struct Inner {
    state: SchedulerState,
    binding: Option<Binding>,
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

/// Output loop for one physical device.
///
/// Every method takes `&self`; the scheduler can be shared between threads
/// and stopped from any of them.
pub struct DeviceScheduler {
    name: String,
    inner: Mutex<Inner>,
    stopping: Mutex<()>,
    counters: Arc<Counters>,
    halted: Arc<AtomicBool>,
}

impl DeviceScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                binding: None,
                stop_tx: None,
                threads: Vec::new(),
            }),
            stopping: Mutex::new(()),
            counters: Arc::new(Counters::default()),
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        self.lock()
            .map(|inner| inner.state)
            .unwrap_or(SchedulerState::Stopped)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    pub fn table(&self) -> Option<Arc<AddressingTable>> {
        self.lock()
            .ok()
            .and_then(|inner| inner.binding.as_ref().map(|binding| binding.table.clone()))
    }

    /// Builds the device's addressing table and binds it to a stage.
    pub fn configure(&self, device: &DeviceConfig, reader: SnapshotReader) -> Result<()> {
        device.validate()?;
        let table = AddressingTable::generate(device.width_px, device.height_px, &device.wiring)?;

        let mut inner = self.lock()?;
        match inner.state {
            SchedulerState::Idle | SchedulerState::Configured => {}
            state => {
                return Err(LedWallError::msg(format!(
                    "device `{}` cannot be configured while {state:?}",
                    self.name
                )))
            }
        }
        inner.binding = Some(Binding {
            table: Arc::new(table),
            reader,
            rate_hz: device.rate_hz,
        });
        inner.state = SchedulerState::Configured;
        debug!(device = %self.name, "scheduler configured");
        Ok(())
    }

    /// Starts ticking. Only valid once configured.
    pub fn start(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut inner = self.lock()?;
        let binding = match (inner.state, inner.binding.as_ref()) {
            (SchedulerState::Configured, Some(binding)) => binding,
            (state, _) => {
                return Err(LedWallError::msg(format!(
                    "device `{}` cannot start while {state:?}",
                    self.name
                )))
            }
        };

        let mut pacer = FramePacer::new(binding.rate_hz)?;
        let table = binding.table.clone();
        let reader = binding.reader.clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (frame_tx, frame_rx) = bounded::<Vec<u8>>(1);

        let sender = {
            let name = self.name.clone();
            let counters = self.counters.clone();
            let halted = self.halted.clone();
            thread::Builder::new()
                .name(format!("transport-{}", self.name))
                .spawn(move || transmit_loop(&name, transport, frame_rx, &counters, &halted))
                .map_err(|err| LedWallError::msg(format!("failed to spawn transport thread: {err}")))?
        };

        let ticker = {
            let name = self.name.clone();
            let counters = self.counters.clone();
            thread::Builder::new()
                .name(format!("device-{}", self.name))
                .spawn(move || {
                    info!(device = %name, rate = ?pacer.interval(), "device output started");
                    loop {
                        if !tick(&name, &table, &reader, &frame_tx, &counters) {
                            break;
                        }
                        if !pacer.wait_or_stop(&stop_rx) {
                            break;
                        }
                    }
                    info!(device = %name, overruns = pacer.overruns(), "device output stopped");
                })
        };
        let ticker = match ticker {
            Ok(ticker) => ticker,
            Err(err) => {
                // the transport thread exits once its channel closes
                self.halted.store(true, Ordering::Release);
                let _ = sender.join();
                return Err(LedWallError::msg(format!("failed to spawn device thread: {err}")));
            }
        };

        inner.stop_tx = Some(stop_tx);
        inner.threads = vec![ticker, sender];
        inner.state = SchedulerState::Running;
        Ok(())
    }

    /// Stops the device. Once this returns no further transmission happens.
    /// Safe to call from any thread and more than once.
    pub fn stop(&self) {
        self.halted.store(true, Ordering::Release);
        // concurrent callers wait here until the threads are joined
        let _stopping = match self.stopping.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (stop_tx, threads) = {
            let mut inner = self.lock_or_recover();
            (inner.stop_tx.take(), std::mem::take(&mut inner.threads))
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.try_send(());
        }
        for thread in threads {
            if thread.join().is_err() {
                warn!(device = %self.name, "device thread panicked");
            }
        }

        let mut inner = self.lock_or_recover();
        if inner.state != SchedulerState::Stopped {
            inner.state = SchedulerState::Stopped;
            debug!(device = %self.name, "scheduler stopped");
        }
    }

    fn lock_or_recover(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| LedWallError::msg("device scheduler has been poisoned"))
    }
}

impl Drop for DeviceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for DeviceScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScheduler")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// One scheduler tick. Returns false once the transport thread is gone.
fn tick(
    name: &str,
    table: &AddressingTable,
    reader: &SnapshotReader,
    frames: &Sender<Vec<u8>>,
    counters: &Counters,
) -> bool {
    Counters::bump(&counters.ticks);

    let Some(snapshot) = reader.try_read() else {
        Counters::bump(&counters.not_ready);
        trace!(device = %name, "snapshot not ready");
        return true;
    };

    if frames.is_full() {
        Counters::bump(&counters.dropped_busy);
        trace!(device = %name, "transport busy, skipping tick");
        return true;
    }

    let mut buffer = vec![0u8; table.buffer_len()];
    if let Err(err) = table.repack(snapshot.data(), &mut buffer) {
        warn!(device = %name, error = %err, "snapshot does not fit device");
        return true;
    }

    let version = snapshot.version();
    if counters.last_version.swap(version, Ordering::Relaxed) == version {
        Counters::bump(&counters.repeated);
    }

    match frames.try_send(buffer) {
        Ok(()) => {
            Counters::bump(&counters.queued);
            true
        }
        Err(TrySendError::Full(_)) => {
            Counters::bump(&counters.dropped_busy);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

fn transmit_loop(
    name: &str,
    mut transport: Box<dyn Transport>,
    frames: Receiver<Vec<u8>>,
    counters: &Counters,
    halted: &AtomicBool,
) {
    for frame in frames.iter() {
        if halted.load(Ordering::Acquire) {
            break;
        }
        match transport.send(&frame) {
            Ok(()) => {
                Counters::bump(&counters.transmitted);
            }
            Err(err) => {
                if Counters::bump(&counters.transport_errors) == 1 {
                    warn!(device = %name, error = %err, "transport failed");
                } else {
                    debug!(device = %name, error = %err, "transport failed");
                }
            }
        }
    }
}
