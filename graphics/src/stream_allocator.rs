//! Thread-safe ring allocator for GPU-visible item streams.
//!
//! Occlusion-query boxes and transient query results are written fresh every
//! frame into a GPU buffer. [`StreamAllocator`] hands out contiguous runs of
//! fixed-size items from one buffer, treating it as a ring:
//!
//! ```text
//!  tail (oldest in-flight item)        head (next free item)
//!   │                                   │
//!   ▼                                   ▼
//! [ frame 5 | frame 6 | frame 7 ......... free ......... ]
//! ```
//!
//! At the end of every frame the current head is recorded as a frame mark;
//! once the GPU completes that frame, [`reclaim`](StreamAllocator::reclaim)
//! moves the tail past it.
//!
//! # Concurrency
//!
//! Several stage builders allocate at once. The fast path only takes the
//! shared lock and bumps the head with a compare-and-swap. When the ring is
//! full the exclusive lock is taken, the buffer doubles (rounded to the
//! allocation granularity), and the old buffer goes to the retirement queue
//! since in-flight frames may still read it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{GpuBuffer, GpuDevice};
use crate::error::{RenderError, RenderResult};
use crate::profiling::profile_plot;
use crate::retirement::RetirementQueue;
use crate::types::{BufferDescriptor, BufferUsage};

/// Placement alignment of stream buffers in bytes.
pub const PLACEMENT_ALIGNMENT: u64 = 256;

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// A run of items allocated from a [`StreamAllocator`].
#[derive(Clone)]
pub struct StreamAllocation {
    buffer: Arc<dyn GpuBuffer>,
    first: u64,
    count: u32,
    item_size: u64,
}

impl StreamAllocation {
    /// Buffer the items live in.
    pub fn buffer(&self) -> &Arc<dyn GpuBuffer> {
        &self.buffer
    }

    /// Index of the first item in the buffer.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Number of items.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Byte offset of item `index` of this allocation.
    pub fn offset_of(&self, index: u32) -> u64 {
        (self.first + index as u64) * self.item_size
    }

    /// GPU address of the first item.
    pub fn gpu_address(&self) -> u64 {
        self.buffer.gpu_address() + self.offset_of(0)
    }

    /// Upload `items` starting at item `start` of this allocation.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidParameter`] if the items don't fit or
    /// have the wrong size.
    pub fn write<T: bytemuck::Pod>(&self, start: u32, items: &[T]) -> RenderResult<()> {
        if std::mem::size_of::<T>() as u64 != self.item_size {
            return Err(RenderError::InvalidParameter(format!(
                "item of {} bytes written to stream of {}-byte items",
                std::mem::size_of::<T>(),
                self.item_size
            )));
        }
        if start as u64 + items.len() as u64 > self.count as u64 {
            return Err(RenderError::InvalidParameter(format!(
                "{} items at {start} overflow allocation of {}",
                items.len(),
                self.count
            )));
        }
        self.buffer.write(self.offset_of(start), bytemuck::cast_slice(items))
    }
}

impl std::fmt::Debug for StreamAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAllocation")
            .field("buffer", &self.buffer.id())
            .field("first", &self.first)
            .field("count", &self.count)
            .finish()
    }
}

struct Chunk {
    buffer: Arc<dyn GpuBuffer>,
    /// Capacity in items.
    capacity: u64,
    /// Monotonic item cursor; the ring position is `head % capacity`.
    head: AtomicU64,
    /// Oldest cursor still referenced by an in-flight frame.
    tail: u64,
    /// `(frame_id, head at end of frame)`, oldest first.
    marks: VecDeque<(u64, u64)>,
}

impl Chunk {
    fn try_allocate(&self, count: u64) -> Option<u64> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let pos = head % self.capacity;
            // Runs never wrap; skip the tail end of the ring instead.
            let start = if pos + count > self.capacity {
                head - pos + self.capacity
            } else {
                head
            };
            let end = start + count;
            if end - self.tail > self.capacity {
                return None;
            }
            match self
                .head
                .compare_exchange_weak(head, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(start % self.capacity),
                Err(actual) => head = actual,
            }
        }
    }
}

/// Ring allocator of fixed-size items in a growable GPU buffer.
pub struct StreamAllocator {
    device: Arc<dyn GpuDevice>,
    retirement: Arc<RetirementQueue>,
    label: String,
    usage: BufferUsage,
    item_size: u64,
    granularity: u64,
    chunk: RwLock<Chunk>,
    allocations: AtomicU64,
}

impl StreamAllocator {
    /// Create an allocator with room for at least `initial_capacity` items.
    ///
    /// # Errors
    ///
    /// Fails if the buffer cannot be created or `item_size` is zero.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        retirement: Arc<RetirementQueue>,
        label: &str,
        usage: BufferUsage,
        item_size: u64,
        initial_capacity: u64,
    ) -> RenderResult<Self> {
        if item_size == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "stream allocator '{label}' with zero item size"
            )));
        }
        let granularity = lcm(item_size, PLACEMENT_ALIGNMENT) / item_size;
        let capacity = initial_capacity.max(1).div_ceil(granularity) * granularity;
        let buffer = Self::create_buffer(device.as_ref(), label, usage, item_size, capacity)?;
        Ok(Self {
            device,
            retirement,
            label: label.to_string(),
            usage,
            item_size,
            granularity,
            chunk: RwLock::new(Chunk {
                buffer,
                capacity,
                head: AtomicU64::new(0),
                tail: 0,
                marks: VecDeque::new(),
            }),
            allocations: AtomicU64::new(0),
        })
    }

    fn create_buffer(
        device: &dyn GpuDevice,
        label: &str,
        usage: BufferUsage,
        item_size: u64,
        capacity: u64,
    ) -> RenderResult<Arc<dyn GpuBuffer>> {
        device.create_buffer(
            &BufferDescriptor::new(capacity * item_size, usage | BufferUsage::UPLOAD)
                .with_label(label),
        )
    }

    /// Allocate `count` contiguous items, growing the buffer if needed.
    ///
    /// # Errors
    ///
    /// Buffer creation failures during growth are fatal.
    pub fn allocate(&self, count: u32) -> RenderResult<StreamAllocation> {
        let count64 = count.max(1) as u64;
        {
            let chunk = self.chunk.read();
            if let Some(first) = chunk.try_allocate(count64) {
                return Ok(self.finish_allocation(&chunk, first, count));
            }
        }

        let mut chunk = self.chunk.write();
        // Another thread may have grown the buffer in the meantime.
        if let Some(first) = chunk.try_allocate(count64) {
            return Ok(self.finish_allocation(&chunk, first, count));
        }

        let needed = (chunk.capacity * 2).max(count64);
        let capacity = needed.div_ceil(self.granularity) * self.granularity;
        let buffer = Self::create_buffer(
            self.device.as_ref(),
            &self.label,
            self.usage,
            self.item_size,
            capacity,
        )?;
        log::debug!(
            "Stream allocator '{}' grown from {} to {} items",
            self.label,
            chunk.capacity,
            capacity
        );
        profile_plot!("stream_allocator_capacity", capacity);

        let old = std::mem::replace(&mut chunk.buffer, buffer);
        self.retirement.retire(old);
        chunk.capacity = capacity;
        *chunk.head.get_mut() = 0;
        chunk.tail = 0;
        chunk.marks.clear();

        let first = chunk
            .try_allocate(count64)
            .ok_or(RenderError::OutOfMemory)?;
        Ok(self.finish_allocation(&chunk, first, count))
    }

    fn finish_allocation(&self, chunk: &Chunk, first: u64, count: u32) -> StreamAllocation {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        StreamAllocation {
            buffer: chunk.buffer.clone(),
            first,
            count,
            item_size: self.item_size,
        }
    }

    /// Record the end of `frame_id`: everything allocated so far belongs to it.
    pub fn on_frame_finish(&self, frame_id: u64) {
        let mut chunk = self.chunk.write();
        let head = *chunk.head.get_mut();
        chunk.marks.push_back((frame_id, head));
    }

    /// Release items of frames up to `completed_frame_id`.
    pub fn reclaim(&self, completed_frame_id: u64) {
        let mut chunk = self.chunk.write();
        while let Some(&(frame, head)) = chunk.marks.front() {
            if frame > completed_frame_id {
                break;
            }
            chunk.tail = head;
            chunk.marks.pop_front();
        }
    }

    /// Capacity of the current buffer in items.
    pub fn capacity(&self) -> u64 {
        self.chunk.read().capacity
    }

    /// Items currently held by in-flight or current frames.
    pub fn in_use(&self) -> u64 {
        let chunk = self.chunk.read();
        chunk.head.load(Ordering::Acquire) - chunk.tail
    }

    /// Total allocations served.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Size of one item in bytes.
    pub fn item_size(&self) -> u64 {
        self.item_size
    }
}

static_assertions::assert_impl_all!(StreamAllocator: Send, Sync);

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::frame::FrameClock;

    fn setup(initial: u64) -> (Arc<DummyDevice>, Arc<RetirementQueue>, StreamAllocator) {
        let device = Arc::new(DummyDevice::with_manual_completion());
        let clock = Arc::new(FrameClock::new(device.as_ref()).unwrap());
        let retirement = Arc::new(RetirementQueue::new(clock));
        let allocator = StreamAllocator::new(
            device.clone(),
            retirement.clone(),
            "test stream",
            BufferUsage::VERTEX,
            32,
            initial,
        )
        .unwrap();
        (device, retirement, allocator)
    }

    #[test]
    fn test_lcm_granularity() {
        assert_eq!(lcm(32, 256), 256);
        assert_eq!(lcm(24, 256), 768);
        let (_device, _retirement, allocator) = setup(1);
        // 256 bytes / 32 bytes per item
        assert_eq!(allocator.capacity(), 8);
    }

    #[test]
    fn test_sequential_allocations() {
        let (_device, _retirement, allocator) = setup(16);
        let a = allocator.allocate(3).unwrap();
        let b = allocator.allocate(2).unwrap();
        assert_eq!(a.first(), 0);
        assert_eq!(b.first(), 3);
        assert_eq!(b.offset_of(1), 4 * 32);
        assert_eq!(allocator.allocation_count(), 2);
        assert_eq!(allocator.in_use(), 5);
    }

    #[test]
    fn test_grow_retires_old_buffer() {
        let (_device, retirement, allocator) = setup(8);
        let a = allocator.allocate(6).unwrap();
        let b = allocator.allocate(6).unwrap();
        assert_eq!(allocator.capacity(), 16);
        assert_ne!(a.buffer().id(), b.buffer().id());
        assert_eq!(b.first(), 0);
        assert_eq!(retirement.len(), 1);
    }

    #[test]
    fn test_reclaim_after_completion() {
        let (device, _retirement, allocator) = setup(8);
        allocator.allocate(6).unwrap();
        allocator.on_frame_finish(1);
        assert_eq!(allocator.in_use(), 6);

        allocator.reclaim(0);
        assert_eq!(allocator.in_use(), 6);

        allocator.reclaim(1);
        assert_eq!(allocator.in_use(), 0);

        // Wraps to the start instead of splitting the run.
        let c = allocator.allocate(4).unwrap();
        assert_eq!(c.first(), 0);
        assert_eq!(allocator.capacity(), 8);
        device.complete_all();
    }

    #[test]
    fn test_write_checks_bounds_and_size() {
        let (device, _retirement, allocator) = setup(8);
        let alloc = allocator.allocate(2).unwrap();
        let items = [[1.0f32; 8], [2.0f32; 8]];
        alloc.write(0, &items).unwrap();
        assert!(alloc.write(1, &items).is_err());
        assert!(alloc.write(0, &[0u32; 3]).is_err());

        let bytes = device.read_buffer(alloc.buffer().id()).unwrap();
        assert_eq!(&bytes[32..36], &2.0f32.to_le_bytes());
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        let (_device, _retirement, allocator) = setup(1024);
        let allocator = Arc::new(allocator);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| allocator.allocate(4).unwrap().first())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut firsts: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        firsts.sort_unstable();
        firsts.dedup();
        assert_eq!(firsts.len(), 128);
    }
}
