//! Hand-off of rendered stage frames from the render thread to any number of
//! reader threads.
//!
//! Every publish allocates a fresh [`Snapshot`] and swaps the shared pointer,
//! so a reader holding an `Arc<Snapshot>` keeps a frame that is never written
//! again. The swap is the only synchronisation between the two sides.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::{mapping::BYTES_PER_PIXEL, LedWallError, Result};

/// Immutable copy of a stage's most recently rendered pixels.
///
/// Pixels are RGB, 3 bytes each, row-major with row 0 at the bottom.
pub struct Snapshot {
    width: u32,
    height: u32,
    version: u64,
    data: Box<[u8]>,
}

impl Snapshot {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Monotonic publish counter, starting at 1 for the first frame.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("version", &self.version)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    current: ArcSwapOption<Snapshot>,
    version: AtomicU64,
}

/// Write side, owned by the render thread through its stage.
pub struct SnapshotPublisher {
    slot: Arc<Slot>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot::default()),
        }
    }

    /// Returns a reader bound to this publisher. Readers outlive the publisher.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            slot: self.slot.clone(),
        }
    }

    /// Copies `pixels` into a new buffer and makes it the current snapshot.
    ///
    /// Returns the version assigned to the published frame.
    pub fn publish(&self, width: u32, height: u32, pixels: &[u8]) -> Result<u64> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(LedWallError::invalid(format!(
                "snapshot of {width}x{height} expects {expected} bytes, got {}",
                pixels.len()
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(pixels.len()).map_err(|err| {
            LedWallError::ResourceAllocation(format!("snapshot buffer of {expected} bytes: {err}"))
        })?;
        data.extend_from_slice(pixels);

        let version = self.slot.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.slot.current.store(Some(Arc::new(Snapshot {
            width,
            height,
            version,
            data: data.into_boxed_slice(),
        })));

        Ok(version)
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotPublisher")
            .field("version", &self.slot.version.load(Ordering::Acquire))
            .finish()
    }
}

/// Read side, cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct SnapshotReader {
    slot: Arc<Slot>,
}

impl SnapshotReader {
    /// Returns the current snapshot, or `None` until the first publish.
    /// Never blocks.
    pub fn try_read(&self) -> Option<Arc<Snapshot>> {
        self.slot.current.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.current.load().is_some()
    }

    /// Version of the latest publish, 0 when nothing has been published.
    pub fn version(&self) -> u64 {
        match &*self.slot.current.load() {
            Some(snapshot) => snapshot.version,
            None => 0,
        }
    }
}

impl fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn not_ready_until_first_publish() {
        let publisher = SnapshotPublisher::new();
        let reader = publisher.reader();
        assert!(!reader.is_ready());
        assert!(reader.try_read().is_none());
        assert_eq!(reader.version(), 0);

        let version = publisher.publish(1, 1, &[1, 2, 3]).unwrap();
        assert_eq!(version, 1);
        let snapshot = reader.try_read().expect("published");
        assert_eq!(snapshot.data(), &[1, 2, 3]);
        assert_eq!(snapshot.version(), 1);
    }

    #[test]
    fn held_snapshot_survives_later_publishes() {
        let publisher = SnapshotPublisher::new();
        let reader = publisher.reader();
        publisher.publish(1, 1, &[9, 9, 9]).unwrap();
        let held = reader.try_read().unwrap();

        publisher.publish(1, 1, &[1, 1, 1]).unwrap();
        drop(publisher);

        assert_eq!(held.data(), &[9, 9, 9]);
        let latest = reader.try_read().unwrap();
        assert_eq!(latest.data(), &[1, 1, 1]);
        assert_eq!(latest.version(), 2);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let publisher = SnapshotPublisher::new();
        let err = publisher.publish(2, 2, &[0; 3]).unwrap_err();
        assert!(matches!(err, LedWallError::InvalidConfiguration(_)));
        assert!(!publisher.reader().is_ready());
    }

    #[test]
    fn readers_never_observe_torn_frames() {
        const W: u32 = 16;
        const H: u32 = 16;
        let publisher = SnapshotPublisher::new();
        let reader = publisher.reader();

        let writer = thread::spawn(move || {
            let mut frame = vec![0u8; (W * H) as usize * BYTES_PER_PIXEL];
            for value in 0..500u32 {
                frame.fill(value as u8);
                publisher.publish(W, H, &frame).unwrap();
            }
        });

        let mut last_version = 0;
        while !writer.is_finished() {
            if let Some(snapshot) = reader.try_read() {
                let first = snapshot.data()[0];
                assert!(snapshot.data().iter().all(|b| *b == first));
                assert!(snapshot.version() >= last_version);
                last_version = snapshot.version();
            }
        }
        writer.join().unwrap();
        assert_eq!(reader.version(), 500);
    }
}
