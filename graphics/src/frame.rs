//! Frame versioning for CPU work running ahead of the GPU.
//!
//! [`FrameClock`] owns the global frame counter and the GPU fence that
//! reports how far the GPU got. [`FrameVersioning`] sits on top of it and
//! keeps one versioned copy of per-frame CPU data (command-list pools,
//! scratch streams) per ring slot.
//!
//! # Frame Identity
//!
//! ```text
//! cur_frame_id        ──► frame the CPU is recording (starts at 1)
//! completed_frame_id  ──► last frame the GPU finished (fence value, starts at 0)
//!
//! invariant: completed_frame_id < cur_frame_id
//! ```
//!
//! A resource tagged with frame `F` may be reused or freed once
//! `completed_frame_id >= F`.
//!
//! # Ring Slots
//!
//! The ring index advances by one every frame. Before a slot is handed out
//! again its previous occupant must be GPU-complete:
//!
//! ```text
//! latency = 2
//!
//! Slot 0: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
//! Slot 1: [Frame 2] ──► [Frame 4] ──► [Frame 6] ──►
//! ```
//!
//! # Adaptive Latency
//!
//! With adaptive latency enabled the ring starts with a single slot. When the
//! slot about to be reused is still in flight and the ring is below the
//! maximum latency, a fresh slot is inserted in front of it instead of
//! waiting, so the CPU only blocks once the maximum latency is reached.
//!
//! ```text
//! frame 1: [s0*]                 latency 1
//! frame 2: s0 busy -> [s1*, s0]  latency 2
//! frame 3: s0 busy -> [s1, s2*, s0] latency 3
//! frame 4: s0 is next; wait for frame 1 if still busy
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use umbra_graphics::backend::dummy::DummyDevice;
//! use umbra_graphics::{FrameClock, FrameVersioning};
//!
//! let device = Arc::new(DummyDevice::new());
//! let clock = Arc::new(FrameClock::new(device.as_ref()).unwrap());
//! let mut frames = FrameVersioning::<Vec<u32>>::new(device, clock, 3);
//!
//! for _ in 0..4 {
//!     let scratch = frames.on_frame_start().unwrap();
//!     scratch.push(1);
//!     frames.on_frame_finish().unwrap();
//! }
//! assert_eq!(frames.cur_frame_id(), 5);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use umbra_core::pool::{acquire_slot, Poolable};

use crate::backend::{GpuDevice, GpuFence};
use crate::error::{RenderError, RenderResult};
use crate::profiling::{frame_mark, profile_function, profile_plot};

/// Upper bound on frames the CPU may prepare ahead of the GPU.
pub const MAX_FRAME_LATENCY: usize = 3;

/// Default bounded wait on the frame fence.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fence waits longer than this are logged as warnings.
const SLOW_WAIT: Duration = Duration::from_millis(100);

/// Global frame counter plus the fence that tracks GPU completion.
///
/// Shared by everything that tags work with frame IDs: the retirement queue,
/// stream allocators and query pools.
pub struct FrameClock {
    fence: Arc<dyn GpuFence>,
    current: AtomicU64,
}

impl FrameClock {
    /// Create the clock and its fence. The first frame is frame 1.
    pub fn new(device: &dyn GpuDevice) -> RenderResult<Self> {
        Ok(Self {
            fence: device.create_fence(0)?,
            current: AtomicU64::new(1),
        })
    }

    /// Frame currently being recorded.
    pub fn cur_frame_id(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Last frame the GPU completed. Never blocks.
    pub fn completed_frame_id(&self) -> u64 {
        self.fence.completed_value()
    }

    /// The frame fence.
    pub fn fence(&self) -> &dyn GpuFence {
        self.fence.as_ref()
    }

    /// Block until `frame_id` is GPU-complete, failing after `timeout`.
    pub fn wait_for(&self, frame_id: u64, timeout: Duration) -> RenderResult<()> {
        if self.completed_frame_id() >= frame_id {
            return Ok(());
        }
        let start = Instant::now();
        if self.fence.wait(frame_id, timeout)? {
            let waited = start.elapsed();
            if waited >= SLOW_WAIT {
                log::warn!("Slow GPU: waited {waited:?} for frame {frame_id}");
            } else {
                log::trace!("Waited {waited:?} for frame {frame_id}");
            }
            Ok(())
        } else {
            Err(RenderError::FenceTimeout {
                frame_id,
                waited: start.elapsed(),
            })
        }
    }

    fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for FrameClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameClock")
            .field("cur_frame_id", &self.cur_frame_id())
            .field("completed_frame_id", &self.completed_frame_id())
            .finish()
    }
}

static_assertions::assert_impl_all!(FrameClock: Send, Sync);

struct RingSlot<D> {
    data: Option<D>,
    /// Frame that last used this slot, 0 if never used.
    last_frame: u64,
}

impl<D> RingSlot<D> {
    fn vacant() -> Self {
        Self {
            data: None,
            last_frame: 0,
        }
    }
}

/// Ring of per-frame data versions gated by GPU completion.
///
/// # Thread Safety
///
/// Owned by the submission thread. The [`FrameClock`] it advances is shared.
pub struct FrameVersioning<D: Poolable> {
    device: Arc<dyn GpuDevice>,
    clock: Arc<FrameClock>,
    ring: Vec<RingSlot<D>>,
    ring_idx: usize,
    max_frame_latency: usize,
    adaptive: bool,
    fence_timeout: Duration,
    frame_open: bool,
}

impl<D: Poolable> FrameVersioning<D> {
    /// Create with adaptive latency growing up to `max_frame_latency`.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_latency` is 0 or above [`MAX_FRAME_LATENCY`].
    pub fn new(device: Arc<dyn GpuDevice>, clock: Arc<FrameClock>, max_frame_latency: usize) -> Self {
        assert!(
            (1..=MAX_FRAME_LATENCY).contains(&max_frame_latency),
            "max_frame_latency must be in 1..={MAX_FRAME_LATENCY}"
        );
        Self {
            device,
            clock,
            ring: vec![RingSlot::vacant()],
            ring_idx: 0,
            max_frame_latency,
            adaptive: true,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            frame_open: false,
        }
    }

    /// Use a fixed latency equal to the maximum instead of growing it.
    pub fn with_fixed_latency(mut self) -> Self {
        self.adaptive = false;
        self.ring = (0..self.max_frame_latency).map(|_| RingSlot::vacant()).collect();
        self
    }

    /// Set the bounded wait applied to fence waits.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Number of ring slots currently in use.
    pub fn frame_latency(&self) -> usize {
        self.ring.len()
    }

    /// Maximum number of ring slots.
    pub fn max_frame_latency(&self) -> usize {
        self.max_frame_latency
    }

    /// Current ring index.
    pub fn ring_index(&self) -> usize {
        self.ring_idx
    }

    /// Frame currently being recorded.
    pub fn cur_frame_id(&self) -> u64 {
        self.clock.cur_frame_id()
    }

    /// Last GPU-complete frame. Never blocks.
    pub fn completed_frame_id(&self) -> u64 {
        self.clock.completed_frame_id()
    }

    /// The shared clock.
    pub fn clock(&self) -> &Arc<FrameClock> {
        &self.clock
    }

    /// Begin a frame: advance the ring and hand out the slot's data.
    ///
    /// The data is created on first use of the slot and reset on every
    /// later use. Blocks (bounded) if the slot's previous frame is still in
    /// flight and the latency cannot grow.
    ///
    /// # Errors
    ///
    /// Fence failures and timeouts are fatal.
    ///
    /// # Panics
    ///
    /// Panics if the previous frame was not finished.
    pub fn on_frame_start(&mut self) -> RenderResult<&mut D> {
        profile_function!();
        assert!(!self.frame_open, "on_frame_start called twice without on_frame_finish");

        let cur = self.clock.cur_frame_id();
        let idx = if self.ring[self.ring_idx].last_frame == 0 {
            self.ring_idx
        } else {
            (self.ring_idx + 1) % self.ring.len()
        };

        let occupant = self.ring[idx].last_frame;
        if occupant > self.clock.completed_frame_id() {
            if self.adaptive && self.ring.len() < self.max_frame_latency {
                self.ring.insert(idx, RingSlot::vacant());
                log::debug!(
                    "Frame latency grown to {} (frame {} still in flight)",
                    self.ring.len(),
                    occupant
                );
                profile_plot!("frame_latency", self.ring.len());
            } else {
                self.clock.wait_for(occupant, self.fence_timeout)?;
            }
        }

        self.ring_idx = idx;
        let slot = &mut self.ring[idx];
        slot.last_frame = cur;
        self.frame_open = true;
        log::trace!("Begin frame {} (slot {})", cur, self.ring_idx);
        let (data, _fresh) = acquire_slot(&mut slot.data);
        Ok(data)
    }

    /// Data of the frame being recorded, if a frame is open.
    pub fn current(&self) -> Option<&D> {
        if !self.frame_open {
            return None;
        }
        self.ring[self.ring_idx].data.as_ref()
    }

    /// Mutable data of the frame being recorded, if a frame is open.
    pub fn current_mut(&mut self) -> Option<&mut D> {
        if !self.frame_open {
            return None;
        }
        self.ring[self.ring_idx].data.as_mut()
    }

    /// Finish the frame: signal the fence with its ID and advance the counter.
    ///
    /// Returns the ID of the frame just submitted.
    ///
    /// # Panics
    ///
    /// Panics if no frame was started.
    pub fn on_frame_finish(&mut self) -> RenderResult<u64> {
        assert!(self.frame_open, "on_frame_finish called without on_frame_start");
        let finished = self.clock.cur_frame_id();
        self.device.signal(self.clock.fence(), finished)?;
        self.clock.advance();
        self.frame_open = false;
        log::trace!("End frame {finished}");
        frame_mark!();
        Ok(finished)
    }

    /// Block until `frame_id` (or the last submitted frame) is GPU-complete.
    pub fn wait_for_gpu(&self, frame_id: Option<u64>) -> RenderResult<()> {
        let last_submitted = self.clock.cur_frame_id() - 1;
        let target = frame_id.unwrap_or(last_submitted).min(last_submitted);
        self.clock.wait_for(target, self.fence_timeout)
    }
}

impl<D: Poolable> Drop for FrameVersioning<D> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_gpu(None) {
            log::error!("Failed to wait for GPU while releasing frame data: {e}");
        }
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use rstest::rstest;

    #[derive(Debug, Default)]
    struct Scratch {
        items: Vec<u64>,
        resets: u32,
    }

    impl Poolable for Scratch {
        fn new_empty() -> Self {
            Self::default()
        }
        fn reset(&mut self) {
            self.items.clear();
            self.resets += 1;
        }
    }

    fn setup(manual: bool) -> (Arc<DummyDevice>, Arc<FrameClock>) {
        let device = Arc::new(if manual {
            DummyDevice::with_manual_completion()
        } else {
            DummyDevice::new()
        });
        let clock = Arc::new(FrameClock::new(device.as_ref()).unwrap());
        (device, clock)
    }

    #[test]
    fn test_first_frame_ids() {
        let (device, clock) = setup(false);
        let frames = FrameVersioning::<Scratch>::new(device, clock, 2);
        assert_eq!(frames.cur_frame_id(), 1);
        assert_eq!(frames.completed_frame_id(), 0);
        assert_eq!(frames.frame_latency(), 1);
    }

    #[test]
    #[should_panic(expected = "max_frame_latency must be in")]
    fn test_zero_latency_panics() {
        let (device, clock) = setup(false);
        let _ = FrameVersioning::<Scratch>::new(device, clock, 0);
    }

    #[test]
    #[should_panic(expected = "without on_frame_start")]
    fn test_finish_without_start_panics() {
        let (device, clock) = setup(false);
        let mut frames = FrameVersioning::<Scratch>::new(device, clock, 2);
        let _ = frames.on_frame_finish();
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn test_slot_reuse_resets_data(#[case] latency: usize) {
        let (device, clock) = setup(false);
        let mut frames = FrameVersioning::<Scratch>::new(device, clock, latency).with_fixed_latency();

        for frame in 0..(latency as u64 * 2) {
            let data = frames.on_frame_start().unwrap();
            assert!(data.items.is_empty());
            if frame >= latency as u64 {
                assert_eq!(data.resets, 1);
            }
            data.items.push(frame);
            frames.on_frame_finish().unwrap();
        }
    }

    #[test]
    fn test_latency_grows_while_gpu_lags() {
        let (device, clock) = setup(true);
        let mut frames = FrameVersioning::<Scratch>::new(device.clone(), clock, 3);

        for expected in 1..=3 {
            frames.on_frame_start().unwrap();
            assert_eq!(frames.frame_latency(), expected);
            frames.on_frame_finish().unwrap();
        }

        // The ring is full; the fourth frame must wait for frame 1.
        let mut frames = frames.with_fence_timeout(Duration::from_millis(1));
        assert!(matches!(
            frames.on_frame_start(),
            Err(RenderError::FenceTimeout { frame_id: 1, .. })
        ));

        // Retrying after the GPU caught up reuses the oldest slot.
        device.complete_up_to(1);
        frames.on_frame_start().unwrap();
        assert_eq!(frames.frame_latency(), 3);
        device.complete_all();
    }

    #[test]
    fn test_latency_stays_when_gpu_keeps_up() {
        let (device, clock) = setup(false);
        let mut frames = FrameVersioning::<Scratch>::new(device, clock, 3);
        for _ in 0..10 {
            frames.on_frame_start().unwrap();
            frames.on_frame_finish().unwrap();
        }
        assert_eq!(frames.frame_latency(), 1);
    }

    #[test]
    fn test_completed_never_exceeds_current() {
        let (device, clock) = setup(true);
        let mut frames = FrameVersioning::<Scratch>::new(device.clone(), clock, 3);
        let mut last_completed = 0;
        for frame in 1..=20u64 {
            frames.on_frame_start().unwrap();
            frames.on_frame_finish().unwrap();
            if frame % 2 == 0 {
                device.complete_up_to(frame - 1);
            }
            let completed = frames.completed_frame_id();
            assert!(completed <= frames.cur_frame_id());
            assert!(completed >= last_completed);
            last_completed = completed;
        }
        device.complete_all();
    }

    #[test]
    fn test_wait_for_gpu_after_completion() {
        let (device, clock) = setup(true);
        let mut frames = FrameVersioning::<Scratch>::new(device.clone(), clock, 2)
            .with_fence_timeout(Duration::from_millis(1));
        frames.on_frame_start().unwrap();
        frames.on_frame_finish().unwrap();

        assert!(frames.wait_for_gpu(None).is_err());
        device.complete_all();
        frames.wait_for_gpu(None).unwrap();
        frames.wait_for_gpu(Some(100)).unwrap();
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let (device, clock) = setup(true);
        let mut frames = FrameVersioning::<Scratch>::new(device.clone(), clock, 1);
        frames.on_frame_start().unwrap();
        frames.on_frame_finish().unwrap();
        device.lose_device();
        assert_eq!(frames.on_frame_start().err(), Some(RenderError::DeviceLost));
    }
}
