//! Cooperative render pipeline.
//!
//! [`RenderPipeline`] walks a FIFO of render stages whose construction runs
//! elsewhere (worker threads, see [`TaskHandle`]). The submission thread pulls
//! one [`WorkItem`] at a time with [`get_next`](RenderPipeline::get_next) and
//! never blocks: a stage that is not built yet yields [`Pull::NotReady`].
//!
//! # States
//!
//! ```text
//!            append_stage
//!   ┌──────┐ ──────────► ┌──────────────┐  front ready   ┌─────────────┐
//!   │ Idle │             │ WaitingStage │ ─────────────► │ ActiveStage │
//!   └──────┘ ◄────────── └──────────────┘   sync()       └──────┬──────┘
//!       ▲      queue empty        ▲                              │ None
//!       │                         │ more stages queued           ▼
//!       │                         └──────────────────────── ┌──────────┐
//!       └────────────────────────────────────────────────── │ Draining │
//!                                                           └──────────┘
//! ```
//!
//! Stages are consumed strictly in the order they were appended, no matter
//! which one finishes building first.
//!
//! # Example
//!
//! ```
//! use umbra_core::compute::TaskHandle;
//! use umbra_graphics::backend::dummy::DummyDevice;
//! use umbra_graphics::cmd_list::CmdListPool;
//! use umbra_graphics::pipeline::{PipelineStage, Pull, RenderPipeline, StageContext};
//!
//! let device = DummyDevice::new();
//! let mut pool = CmdListPool::default();
//! let mut pipeline = RenderPipeline::new();
//!
//! let (pending, completer) = TaskHandle::pending();
//! pipeline.append_stage(pending);
//!
//! let mut ctx = StageContext { device: &device, cmd_lists: &mut pool, frame_id: 1 };
//! assert!(matches!(pipeline.get_next(&mut ctx), Ok(Pull::NotReady)));
//!
//! let cmd = ctx.acquire("baked").unwrap();
//! completer.complete(Ok(PipelineStage::CommandList(cmd)));
//! assert!(matches!(pipeline.get_next(&mut ctx), Ok(Pull::Item(_))));
//! assert!(matches!(pipeline.get_next(&mut ctx), Ok(Pull::Exhausted)));
//! ```

mod stage;

pub use stage::{PipelineStage, RenderStage, StageContext, StagePhase, WorkItem};

use std::collections::VecDeque;

use umbra_core::compute::TaskHandle;

use crate::error::{RenderError, RenderResult};
use crate::profiling::profile_scope;

/// Asynchronously constructed stage.
pub type PendingStage = TaskHandle<RenderResult<PipelineStage>>;

/// Outcome of one pull.
#[derive(Debug)]
pub enum Pull {
    Item(WorkItem),
    /// Nothing ready yet. Try again on the next tick.
    NotReady,
    /// No current stage and nothing queued.
    Exhausted,
}

/// Pipeline state between and during pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No current stage and nothing queued.
    Idle,
    /// The front of the queue is not built yet.
    WaitingStage,
    /// A synchronized stage is being pulled.
    ActiveStage,
    /// The current stage just ran out and the next one is about to be
    /// popped. Only held inside [`RenderPipeline::get_next`]; a call always
    /// leaves the pipeline in one of the other states.
    Draining,
}

/// FIFO of pending render stages with a pull-based consumer.
///
/// Single-threaded and non-reentrant; only stage construction runs elsewhere.
pub struct RenderPipeline {
    queue: VecDeque<PendingStage>,
    current: Option<Box<dyn RenderStage>>,
    state: PipelineState,
}

impl Default for RenderPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPipeline {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            state: PipelineState::Idle,
        }
    }

    /// Enqueue a stage under construction.
    pub fn append_stage(&mut self, stage: PendingStage) {
        self.queue.push_back(stage);
        if self.current.is_none() {
            self.state = PipelineState::WaitingStage;
        }
    }

    /// Enqueue a stage that is already built.
    pub fn append_ready(&mut self, stage: PipelineStage) {
        self.append_stage(TaskHandle::ready(Ok(stage)));
    }

    /// State after the last call. Never [`PipelineState::Draining`].
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Returns `true` if there is neither a current stage nor a queued one.
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    /// Number of stages not yet started.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Name of the stage being pulled.
    pub fn current_stage(&self) -> Option<&str> {
        self.current.as_deref().map(RenderStage::name)
    }

    /// Abandon the current stage without running its remaining phases.
    pub fn terminate_stage_traverse(&mut self) {
        if let Some(stage) = self.current.take() {
            log::debug!("Terminated traversal of stage '{}'", stage.name());
        }
        self.state = if self.queue.is_empty() {
            PipelineState::Idle
        } else {
            PipelineState::WaitingStage
        };
    }

    /// Drop the current stage and everything queued.
    pub fn clear(&mut self) {
        self.terminate_stage_traverse();
        self.queue.clear();
        self.state = PipelineState::Idle;
    }

    /// Pull the next work item.
    ///
    /// # Errors
    ///
    /// Stage construction failures and stage recording failures are
    /// returned as is; a construction that was dropped without a result
    /// becomes [`RenderError::StageConstructionFailed`].
    pub fn get_next(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Pull> {
        profile_scope!("RenderPipeline::get_next");
        loop {
            if let Some(stage) = self.current.as_mut() {
                if let Some(item) = stage.next_work_item(ctx)? {
                    return Ok(Pull::Item(item));
                }
                log::trace!("Stage '{}' exhausted", stage.name());
                self.current = None;
                self.state = PipelineState::Draining;
            }

            let Some(front) = self.queue.front_mut() else {
                self.state = PipelineState::Idle;
                return Ok(Pull::Exhausted);
            };
            let Some(built) = front.try_take() else {
                if front.is_abandoned() {
                    self.queue.pop_front();
                    return Err(RenderError::StageConstructionFailed(
                        "stage builder dropped without a result".into(),
                    ));
                }
                self.state = PipelineState::WaitingStage;
                return Ok(Pull::NotReady);
            };
            self.queue.pop_front();

            match built? {
                PipelineStage::CommandList(cmd) => {
                    log::trace!("Popped baked command list '{}'", cmd.label());
                    self.state = if self.queue.is_empty() {
                        PipelineState::Idle
                    } else {
                        PipelineState::WaitingStage
                    };
                    return Ok(Pull::Item(WorkItem::CommandList(cmd)));
                }
                PipelineStage::Stage(mut stage) => {
                    log::trace!("Synchronizing stage '{}'", stage.name());
                    stage.sync(ctx)?;
                    self.current = Some(stage);
                    self.state = PipelineState::ActiveStage;
                }
            }
        }
    }
}

impl std::fmt::Debug for RenderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("state", &self.state)
            .field("current", &self.current_stage())
            .field("pending", &self.queue.len())
            .finish()
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::cmd_list::CmdListPool;

    /// Emits `count` passes, one per phase step.
    struct CountingStage {
        name: String,
        remaining: usize,
        synced: bool,
    }

    impl RenderStage for CountingStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn sync(&mut self, _ctx: &mut StageContext<'_>) -> RenderResult<()> {
            self.synced = true;
            Ok(())
        }

        fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>> {
            assert!(self.synced, "pulled before sync");
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(WorkItem::Pass {
                stage: self.name.clone(),
                phase: StagePhase::MainRange,
                cmd: ctx.acquire(&self.name)?,
            }))
        }
    }

    fn counting(name: &str, remaining: usize) -> PipelineStage {
        PipelineStage::Stage(Box::new(CountingStage {
            name: name.into(),
            remaining,
            synced: false,
        }))
    }

    #[test]
    fn test_states() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::default();
        let mut ctx = StageContext {
            device: &device,
            cmd_lists: &mut pool,
            frame_id: 1,
        };
        let mut pipeline = RenderPipeline::new();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.is_empty());

        pipeline.append_ready(counting("a", 1));
        assert_eq!(pipeline.state(), PipelineState::WaitingStage);

        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::Item(_)));
        assert_eq!(pipeline.state(), PipelineState::ActiveStage);
        assert_eq!(pipeline.current_stage(), Some("a"));

        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::Exhausted));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_exhausted_stage_leaves_no_draining_state() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::default();
        let mut ctx = StageContext {
            device: &device,
            cmd_lists: &mut pool,
            frame_id: 1,
        };
        let mut pipeline = RenderPipeline::new();
        pipeline.append_ready(counting("a", 1));
        let (pending, completer) = TaskHandle::pending();
        pipeline.append_stage(pending);

        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::Item(_)));
        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::NotReady));
        assert_eq!(pipeline.state(), PipelineState::WaitingStage);
        assert_eq!(pipeline.current_stage(), None);

        completer.complete(Ok(counting("b", 1)));
        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::Item(_)));
        assert_eq!(pipeline.state(), PipelineState::ActiveStage);
        assert!(matches!(pipeline.get_next(&mut ctx).unwrap(), Pull::Exhausted));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_terminate_abandons_stage() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::default();
        let mut ctx = StageContext {
            device: &device,
            cmd_lists: &mut pool,
            frame_id: 1,
        };
        let mut pipeline = RenderPipeline::new();
        pipeline.append_ready(counting("long", 10));
        pipeline.append_ready(counting("next", 1));

        pipeline.get_next(&mut ctx).unwrap();
        pipeline.terminate_stage_traverse();
        assert_eq!(pipeline.state(), PipelineState::WaitingStage);

        let Pull::Item(item) = pipeline.get_next(&mut ctx).unwrap() else {
            panic!("expected an item from the next stage");
        };
        assert!(matches!(item, WorkItem::Pass { ref stage, .. } if stage == "next"));
    }

    #[test]
    fn test_failed_construction_propagates() {
        let device = DummyDevice::new();
        let mut pool = CmdListPool::default();
        let mut ctx = StageContext {
            device: &device,
            cmd_lists: &mut pool,
            frame_id: 1,
        };
        let mut pipeline = RenderPipeline::new();
        pipeline.append_stage(TaskHandle::ready(Err(RenderError::OutOfMemory)));
        assert_eq!(pipeline.get_next(&mut ctx).unwrap_err(), RenderError::OutOfMemory);

        let (pending, completer) = TaskHandle::pending();
        pipeline.append_stage(pending);
        drop(completer);
        assert!(matches!(
            pipeline.get_next(&mut ctx),
            Err(RenderError::StageConstructionFailed(_))
        ));
        assert!(pipeline.is_empty());
    }
}
