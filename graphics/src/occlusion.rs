//! Hardware occlusion query batches.
//!
//! A [`QueryBatch`] is a run of occlusion queries plus the buffer their
//! results are resolved into. Queries come from a shared [`QueryHeapPool`];
//! results live in one of two places:
//!
//! - **Transient**: a slice of the shared results stream, valid for one
//!   frame. [`sync`](QueryBatch::sync) acquires a fresh slice whenever the
//!   frame changes.
//! - **Persistent**: a dedicated results buffer owned by the batch and kept
//!   across frames. It is only reallocated when the query count outgrows it,
//!   and every setup bumps the batch version.
//!
//! ```text
//! setup(n) ─► sync(frame) ─► start/stop × n ─► resolve ─► set(i)… ─► finish
//!                             (cull pass)                (main pass)
//! ```
//!
//! Results are 8 bytes per query, so a resolved result can be used directly
//! as a predication source.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{GpuBuffer, GpuDevice, GpuQueryHeap};
use crate::cmd_list::CmdList;
use crate::error::RenderResult;
use crate::profiling::profile_plot;
use crate::retirement::{RetirementQueue, TrackedResource};
use crate::stream_allocator::{StreamAllocation, StreamAllocator};
use crate::types::{BufferDescriptor, BufferUsage, QueryKind, ResourceState, Transition};

/// Query index meaning "no query was issued".
pub const NPOS: u32 = u32::MAX;

/// Size of one resolved query result in bytes.
pub const QUERY_RESULT_SIZE: u64 = 8;

/// A range of queries in a heap.
#[derive(Clone)]
pub struct QueryRange {
    heap: Arc<dyn GpuQueryHeap>,
    base: u32,
    count: u32,
}

impl QueryRange {
    pub fn heap(&self) -> &dyn GpuQueryHeap {
        self.heap.as_ref()
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Shared query heap, sub-allocated per frame.
///
/// Allocation takes the shared lock and bumps a cursor. When the heap is
/// exhausted it is replaced by one sized to the next power of two under the
/// exclusive lock; ranges handed out earlier keep the old heap alive and the
/// heap itself goes through the retirement queue.
pub struct QueryHeapPool {
    device: Arc<dyn GpuDevice>,
    retirement: Arc<RetirementQueue>,
    kind: QueryKind,
    heap: RwLock<Arc<dyn GpuQueryHeap>>,
    cursor: AtomicU32,
}

impl QueryHeapPool {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        retirement: Arc<RetirementQueue>,
        kind: QueryKind,
        initial_capacity: u32,
    ) -> RenderResult<Self> {
        let heap = device.create_query_heap(kind, initial_capacity.max(1).next_power_of_two())?;
        Ok(Self {
            device,
            retirement,
            kind,
            heap: RwLock::new(heap),
            cursor: AtomicU32::new(0),
        })
    }

    /// Reserve `count` consecutive queries for the current frame.
    pub fn allocate(&self, count: u32) -> RenderResult<QueryRange> {
        let count = count.max(1);
        {
            let heap = self.heap.read();
            if let Some(range) = self.try_allocate(&heap, count) {
                return Ok(range);
            }
        }

        let mut heap = self.heap.write();
        if let Some(range) = self.try_allocate(&heap, count) {
            return Ok(range);
        }
        let capacity = (heap.capacity() + count).next_power_of_two();
        let grown = self.device.create_query_heap(self.kind, capacity)?;
        log::debug!(
            "Query heap grown from {} to {} queries",
            heap.capacity(),
            capacity
        );
        profile_plot!("query_heap_capacity", capacity);
        let old = std::mem::replace(&mut *heap, grown);
        self.retirement.retire(old);
        self.cursor.store(count, Ordering::Release);
        Ok(QueryRange {
            heap: heap.clone(),
            base: 0,
            count,
        })
    }

    fn try_allocate(&self, heap: &Arc<dyn GpuQueryHeap>, count: u32) -> Option<QueryRange> {
        let base = self.cursor.fetch_add(count, Ordering::AcqRel);
        let end = base.checked_add(count)?;
        (end <= heap.capacity()).then(|| QueryRange {
            heap: heap.clone(),
            base,
            count,
        })
    }

    /// Start handing out queries from the beginning of the heap.
    ///
    /// Call once per frame before any batch is set up.
    pub fn on_frame_start(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Capacity of the current heap.
    pub fn capacity(&self) -> u32 {
        self.heap.read().capacity()
    }
}

/// Results slice drawn from the shared stream.
pub struct TransientResults {
    pool: Arc<StreamAllocator>,
    results: Option<StreamAllocation>,
    fresh: bool,
    synced_frame: u64,
}

/// Dedicated, versioned results buffer.
pub struct PersistentResults {
    device: Arc<dyn GpuDevice>,
    buffer: TrackedResource<Arc<dyn GpuBuffer>>,
    capacity: u32,
    version: u32,
    state: ResourceState,
}

/// Where a batch resolves its results.
pub enum BatchResults {
    Transient(TransientResults),
    Persistent(PersistentResults),
}

/// A batch of occlusion queries and their resolved results.
pub struct QueryBatch {
    heaps: Arc<QueryHeapPool>,
    range: Option<QueryRange>,
    count: u32,
    results: BatchResults,
    predicating: bool,
}

impl QueryBatch {
    /// A batch resolving into slices of `pool`, which must hold 8-byte items.
    pub fn transient(heaps: Arc<QueryHeapPool>, pool: Arc<StreamAllocator>) -> Self {
        assert_eq!(pool.item_size(), QUERY_RESULT_SIZE, "query results need 8-byte items");
        Self {
            heaps,
            range: None,
            count: 0,
            results: BatchResults::Transient(TransientResults {
                pool,
                results: None,
                fresh: false,
                synced_frame: 0,
            }),
            predicating: false,
        }
    }

    /// A batch owning its results buffer.
    pub fn persistent(
        heaps: Arc<QueryHeapPool>,
        device: Arc<dyn GpuDevice>,
        retirement: Arc<RetirementQueue>,
    ) -> Self {
        Self {
            heaps,
            range: None,
            count: 0,
            results: BatchResults::Persistent(PersistentResults {
                device,
                buffer: TrackedResource::new(retirement),
                capacity: 0,
                version: 0,
                state: ResourceState::COPY_DEST,
            }),
            predicating: false,
        }
    }

    /// Reserve `count` queries for this frame.
    pub fn setup(&mut self, count: u32) -> RenderResult<()> {
        self.range = Some(self.heaps.allocate(count)?);
        self.count = count;
        match &mut self.results {
            BatchResults::Transient(transient) => {
                transient.fresh = true;
                transient.results = None;
            }
            BatchResults::Persistent(persistent) => {
                if !persistent.buffer.is_set() || persistent.capacity < count {
                    let capacity = count.max(1).next_power_of_two();
                    let buffer = persistent.device.create_buffer(
                        &BufferDescriptor::new(
                            capacity as u64 * QUERY_RESULT_SIZE,
                            BufferUsage::QUERY_RESOLVE | BufferUsage::PREDICATION,
                        )
                        .with_label("persistent query results"),
                    )?;
                    persistent.buffer.set(buffer);
                    persistent.capacity = capacity;
                    persistent.state = ResourceState::COPY_DEST;
                }
                persistent.version += 1;
            }
        }
        Ok(())
    }

    /// Make sure a transient batch has a results slice for `frame_id`.
    ///
    /// Returns `true` if a new slice was acquired. Persistent batches never
    /// need one.
    pub fn sync(&mut self, frame_id: u64) -> RenderResult<bool> {
        let count = self.count();
        match &mut self.results {
            BatchResults::Transient(transient) => {
                if !transient.fresh && transient.synced_frame == frame_id {
                    return Ok(false);
                }
                transient.results = Some(transient.pool.allocate(count.max(1))?);
                transient.fresh = false;
                transient.synced_frame = frame_id;
                Ok(true)
            }
            BatchResults::Persistent(_) => Ok(false),
        }
    }

    /// Number of queries set up.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.results, BatchResults::Persistent(_))
    }

    /// Setup counter of a persistent batch, 0 for transient ones.
    pub fn version(&self) -> u32 {
        match &self.results {
            BatchResults::Persistent(persistent) => persistent.version,
            BatchResults::Transient(_) => 0,
        }
    }

    fn query(&self, index: u32) -> (&QueryRange, u32) {
        let Some(range) = self.range.as_ref() else {
            panic!("query batch used before setup");
        };
        assert!(index < self.count, "query {index} out of {}", self.count);
        (range, range.base + index)
    }

    /// Begin query `index` of the batch.
    pub fn start(&self, cmd: &CmdList, index: u32) {
        let (range, query) = self.query(index);
        cmd.record().begin_query(range.heap(), query);
    }

    /// End query `index` of the batch.
    pub fn stop(&self, cmd: &CmdList, index: u32) {
        let (range, query) = self.query(index);
        cmd.record().end_query(range.heap(), query);
    }

    /// Results buffer and byte offset of result 0.
    pub fn results_location(&self) -> Option<(Arc<dyn GpuBuffer>, u64)> {
        match &self.results {
            BatchResults::Transient(transient) => transient
                .results
                .as_ref()
                .map(|r| (r.buffer().clone(), r.offset_of(0))),
            BatchResults::Persistent(persistent) => {
                persistent.buffer.get().map(|buffer| (buffer.clone(), 0))
            }
        }
    }

    /// Copy all results into the results buffer, then optionally transition
    /// it to `state`.
    ///
    /// # Panics
    ///
    /// Panics if a transient batch was not synced this frame.
    pub fn resolve(&mut self, cmd: &CmdList, state: Option<ResourceState>) {
        let Some((buffer, offset)) = self.results_location() else {
            panic!("query batch resolved without a results buffer");
        };
        let Some(range) = self.range.as_ref() else {
            panic!("query batch resolved before setup");
        };

        let persistent = match &mut self.results {
            BatchResults::Persistent(persistent) => Some(persistent),
            BatchResults::Transient(_) => None,
        };
        if let Some(persistent) = &persistent {
            if persistent.state != ResourceState::COPY_DEST {
                cmd.resource_barrier(Transition {
                    buffer: buffer.id(),
                    before: persistent.state,
                    after: ResourceState::COPY_DEST,
                });
            }
        }

        cmd.record().resolve_queries(
            range.heap(),
            range.base..range.base + self.count,
            buffer.as_ref(),
            offset,
        );

        if let Some(after) = state {
            cmd.resource_barrier(Transition {
                buffer: buffer.id(),
                before: ResourceState::COPY_DEST,
                after,
            });
        }
        if let Some(persistent) = persistent {
            persistent.state = state.unwrap_or(ResourceState::COPY_DEST);
        }
    }

    /// Predicate subsequent draws on query `index`, or stop predicating with
    /// `None` or [`NPOS`].
    pub fn set(&mut self, cmd: &CmdList, index: Option<u32>) {
        match index.filter(|&i| i != NPOS) {
            Some(index) => {
                assert!(index < self.count(), "query {index} out of {}", self.count());
                let Some((buffer, offset)) = self.results_location() else {
                    panic!("predication without a results buffer");
                };
                cmd.record().set_predication(Some((
                    buffer.as_ref(),
                    offset + index as u64 * QUERY_RESULT_SIZE,
                )));
                self.predicating = true;
            }
            None => {
                if self.predicating {
                    cmd.record().set_predication(None);
                    self.predicating = false;
                }
            }
        }
    }

    /// End of the pass using this batch. Clears predication.
    pub fn finish(&mut self, cmd: &CmdList) {
        self.set(cmd, None);
    }

    /// GPU address of a persistent batch's results.
    ///
    /// Only meaningful after [`resolve`](Self::resolve) was called with a
    /// target state in the current frame; this is not checked.
    ///
    /// # Panics
    ///
    /// Panics on transient batches or before the first setup.
    pub fn gpu_ptr(&self) -> u64 {
        match &self.results {
            BatchResults::Persistent(persistent) => match persistent.buffer.get() {
                Some(buffer) => buffer.gpu_address(),
                None => panic!("persistent query batch used before setup"),
            },
            BatchResults::Transient(_) => panic!("gpu_ptr() on a transient query batch"),
        }
    }
}
