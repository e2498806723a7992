//! Render stages and the work items they produce.

use crate::backend::GpuDevice;
use crate::cmd_list::{CmdList, CmdListPool};
use crate::error::RenderResult;

/// Phase cursor of a multi-phase stage.
///
/// ```text
/// Pre ─► CullRange* ─► CullToMain ─► MainRange* ─► Post ─► Done
/// ```
///
/// Ranged phases repeat until the stage runs out of work for them. The cull
/// pass must be fully emitted before [`CullToMain`](Self::CullToMain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StagePhase {
    Pre,
    CullRange,
    CullToMain,
    MainRange,
    Post,
    Done,
}

impl StagePhase {
    /// The phase after this one. `Done` stays `Done`.
    pub fn next(self) -> Self {
        match self {
            Self::Pre => Self::CullRange,
            Self::CullRange => Self::CullToMain,
            Self::CullToMain => Self::MainRange,
            Self::MainRange => Self::Post,
            Self::Post | Self::Done => Self::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::CullRange => "cull",
            Self::CullToMain => "cull to main",
            Self::MainRange => "main",
            Self::Post => "post",
            Self::Done => "done",
        }
    }
}

/// A unit of GPU work handed to the submission thread.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Pre-built commands with no further phases.
    CommandList(CmdList),
    /// One phase (or one range of a ranged phase) of a render stage.
    Pass {
        stage: String,
        phase: StagePhase,
        cmd: CmdList,
    },
}

impl WorkItem {
    /// The commands to submit.
    pub fn cmd_list(&self) -> &CmdList {
        match self {
            Self::CommandList(cmd) | Self::Pass { cmd, .. } => cmd,
        }
    }

    /// Phase of a stage pass, `None` for raw command lists.
    pub fn phase(&self) -> Option<StagePhase> {
        match self {
            Self::CommandList(_) => None,
            Self::Pass { phase, .. } => Some(*phase),
        }
    }

    /// Close and execute the commands.
    pub fn submit(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        self.cmd_list().submit(device)
    }
}

/// What a stage needs from the frame to record its work.
pub struct StageContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub cmd_lists: &'a mut CmdListPool,
    pub frame_id: u64,
}

impl StageContext<'_> {
    /// Next command list of the current frame.
    pub fn acquire(&mut self, label: &str) -> RenderResult<CmdList> {
        self.cmd_lists.acquire(self.device, label)
    }
}

/// A render stage built off the submission thread and consumed by
/// [`RenderPipeline`](super::RenderPipeline) one work item at a time.
pub trait RenderStage: Send {
    fn name(&self) -> &str;

    /// Dependency barrier, invoked once before the first pull.
    fn sync(&mut self, _ctx: &mut StageContext<'_>) -> RenderResult<()> {
        Ok(())
    }

    /// Produce the next work item, or `None` when the stage is exhausted.
    fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>>;
}

/// What an asynchronous stage construction resolves to.
pub enum PipelineStage {
    /// Fully baked commands.
    CommandList(CmdList),
    /// A phased stage.
    Stage(Box<dyn RenderStage>),
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandList(cmd) => f.debug_tuple("CommandList").field(cmd).finish(),
            Self::Stage(stage) => f.debug_tuple("Stage").field(&stage.name()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phase = StagePhase::Pre;
        let mut seen = vec![phase];
        while phase != StagePhase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                StagePhase::Pre,
                StagePhase::CullRange,
                StagePhase::CullToMain,
                StagePhase::MainRange,
                StagePhase::Post,
                StagePhase::Done,
            ]
        );
        assert!(StagePhase::CullRange < StagePhase::MainRange);
    }
}
