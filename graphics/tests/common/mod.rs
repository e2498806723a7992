//! Common utilities for the renderer integration tests.
//!
//! Scene objects, cameras, seeded random scenes and a scripted
//! render stage shared by the test binaries.

#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use umbra_core::bounds::Aabb;
use umbra_core::math::{look_at_rh, orthographic_rh, Vec3, VecN};
use umbra_graphics::hierarchy::ViewFrustum;
use umbra_graphics::pipeline::{RenderStage, StageContext, StagePhase, WorkItem};
use umbra_graphics::{GpuDevice, HierarchyObject, RenderResult};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Scene objects
// ============================================================================

/// Axis-aligned block with an id and a triangle count.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<const D: usize> {
    pub id: usize,
    pub aabb: Aabb<D>,
    pub tris: u32,
}

impl<const D: usize> HierarchyObject<D> for Block<D> {
    fn aabb(&self) -> Aabb<D> {
        self.aabb
    }

    fn tri_count(&self) -> u32 {
        self.tris
    }
}

pub fn square(id: usize, x: f32, y: f32, half: f32) -> Block<2> {
    Block {
        id,
        aabb: Aabb::new(
            VecN::<2>::new(x - half, y - half),
            VecN::<2>::new(x + half, y + half),
        ),
        tris: 2,
    }
}

/// `count` random 2D blocks in `[0, extent)²`, some of them large.
pub fn random_squares(rng: &mut StdRng, count: usize, extent: f32) -> Vec<Block<2>> {
    (0..count)
        .map(|id| {
            let half = if rng.random_range(0..8) == 0 {
                rng.random_range(0.0..extent * 0.2)
            } else {
                rng.random_range(0.05..0.35)
            };
            let (x, y) = (rng.random_range(0.0..extent), rng.random_range(0.0..extent));
            let mut block = square(id, x, y, half);
            block.tris = rng.random_range(1..=16);
            block
        })
        .collect()
}

/// `count` random 3D blocks in `[0, extent)³`.
pub fn random_cubes(rng: &mut StdRng, count: usize, extent: f32) -> Vec<Block<3>> {
    (0..count)
        .map(|id| {
            let center = [
                rng.random_range(0.0..extent),
                rng.random_range(0.0..extent),
                rng.random_range(0.0..extent),
            ];
            let half = rng.random_range(0.05..0.55);
            Block {
                id,
                aabb: Aabb::new(
                    VecN::<3>::new(center[0] - half, center[1] - half, center[2] - half),
                    VecN::<3>::new(center[0] + half, center[1] + half, center[2] + half),
                ),
                tris: 12,
            }
        })
        .collect()
}

// ============================================================================
// Cameras
// ============================================================================

/// Orthographic camera at z = 10 looking down on `[lo, hi]²`.
pub fn top_down(lo: f32, hi: f32) -> ViewFrustum {
    let mid = (lo + hi) * 0.5;
    let half = (hi - lo) * 0.5;
    let view = look_at_rh(
        &Vec3::new(mid, mid, 10.0),
        &Vec3::new(mid, mid, 0.0),
        &Vec3::new(0.0, 1.0, 0.0),
    );
    ViewFrustum::new(orthographic_rh(-half, half, -half, half, 1.0, 20.0) * view)
}

// ============================================================================
// Deterministic randomness
// ============================================================================

/// Seeded generator, reproducible across runs.
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

// ============================================================================
// Stages
// ============================================================================

/// Emits one work item per scripted phase, each with a marker naming the
/// stage and the step.
pub struct ScriptedStage {
    name: String,
    script: Vec<StagePhase>,
    cursor: usize,
}

impl ScriptedStage {
    pub fn new(name: &str, script: &[StagePhase]) -> Self {
        Self {
            name: name.to_string(),
            script: script.to_vec(),
            cursor: 0,
        }
    }

    /// Pre, two cull ranges, cull-to-main, two main ranges, post.
    pub fn full(name: &str) -> Self {
        Self::new(
            name,
            &[
                StagePhase::Pre,
                StagePhase::CullRange,
                StagePhase::CullRange,
                StagePhase::CullToMain,
                StagePhase::MainRange,
                StagePhase::MainRange,
                StagePhase::Post,
            ],
        )
    }
}

impl RenderStage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_work_item(&mut self, ctx: &mut StageContext<'_>) -> RenderResult<Option<WorkItem>> {
        let Some(&phase) = self.script.get(self.cursor) else {
            return Ok(None);
        };
        let cmd = ctx.acquire(&self.name)?;
        cmd.record()
            .marker(&format!("{}:{}", self.name, self.cursor));
        self.cursor += 1;
        Ok(Some(WorkItem::Pass {
            stage: self.name.clone(),
            phase,
            cmd,
        }))
    }
}

/// Shared device handle for APIs taking `Arc<dyn GpuDevice>`.
pub fn shared<T: GpuDevice + Clone>(device: &T) -> Arc<dyn GpuDevice> {
    Arc::new(device.clone())
}
