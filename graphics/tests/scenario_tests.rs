//! End-to-end scenarios and invariant checks.
//!
//! # Test Categories
//!
//! - **Hierarchy**: partition completeness and triangle counts over random scenes
//! - **Visibility**: culled subtrees never reach the draw list
//! - **Frame pacing**: completed frame never overtakes the current frame
//! - **Retirement**: resources are released only after their frame completed

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;
use rstest::rstest;
use umbra_graphics::backend::dummy::DummyDevice;
use umbra_graphics::hierarchy::{SplitTechnique, Unresolved, Visibility};
use umbra_graphics::{
    BuildParams, Bvh, FrameClock, FrameVersioning, GpuDevice, HierarchyObject, RetirementQueue,
    ScheduleParams, TreeStructure, View,
};

use common::{init_logging, random_cubes, random_squares, seeded, shared, square, top_down, Block};

/// Asserts every object sits in exactly one node's exclusive range and that
/// inclusive triangle counts add up.
fn check_hierarchy<const D: usize>(bvh: &Bvh<Block<D>, D>, object_count: usize) {
    let mut seen = HashSet::new();
    for node in bvh.nodes() {
        for object in &bvh.objects()[node.exclusive_objects()] {
            assert!(seen.insert(object.id), "object {} in two nodes", object.id);
        }

        let children: u64 = node.children().map(|c| bvh.node(c).inclusive_tris()).sum();
        assert_eq!(node.inclusive_tris(), node.exclusive_tris() + children);

        let exclusive: u64 = bvh.objects()[node.exclusive_objects()]
            .iter()
            .map(|o| o.tri_count() as u64)
            .sum();
        assert_eq!(node.exclusive_tris(), exclusive);
    }
    assert_eq!(seen.len(), object_count);
}

// ============================================================================
// Hierarchy
// ============================================================================

#[test]
fn test_four_quadrants() {
    init_logging();
    let objects = vec![
        square(0, 1.0, 1.0, 0.5),
        square(1, 3.0, 1.0, 0.5),
        square(2, 1.0, 3.0, 0.5),
        square(3, 3.0, 3.0, 0.5),
    ];
    let bvh = Bvh::build(objects, BuildParams::new(TreeStructure::Quadtree));
    let root = bvh.node(bvh.root().unwrap());

    assert!(root.exclusive_objects().is_empty());
    assert_eq!(root.child_slots().len(), 4);
    assert!(root.child_slots().iter().all(Option::is_some));
    for child in root.children() {
        let child = bvh.node(child);
        assert_eq!(child.exclusive_objects().len(), 1);
        assert!(child.is_leaf());
    }
}

#[rstest]
fn test_partition_2d(
    #[values(TreeStructure::Quadtree, TreeStructure::Enneatree)] structure: TreeStructure,
    #[values(SplitTechnique::Regular, SplitTechnique::Mean)] split: SplitTechnique,
    #[values(1, 7)] seed: u64,
) {
    let mut rng = seeded(seed);
    let objects = random_squares(&mut rng, 500, 64.0);
    let bvh = Bvh::build(objects, BuildParams::new(structure).with_split(split));
    check_hierarchy(&bvh, 500);
    assert!(bvh.node_count() > 1);
}

#[rstest]
fn test_partition_3d(
    #[values(TreeStructure::Octree, TreeStructure::Icoseptree)] structure: TreeStructure,
    #[values(SplitTechnique::Regular, SplitTechnique::Mean)] split: SplitTechnique,
) {
    let mut rng = seeded(42);
    let objects = random_cubes(&mut rng, 400, 32.0);
    let bvh = Bvh::build(objects, BuildParams::new(structure).with_split(split));
    check_hierarchy(&bvh, 400);
    assert_eq!(bvh.total_tris(), 400 * 12);
}

// ============================================================================
// Visibility
// ============================================================================

#[test]
fn test_frustum_excluding_scene_draws_nothing() {
    let mut rng = seeded(3);
    let bvh = Bvh::build(
        random_squares(&mut rng, 200, 16.0),
        BuildParams::new(TreeStructure::Quadtree),
    );
    let mut view = View::new();
    let stats = view.schedule(&bvh, &top_down(100.0, 120.0), &ScheduleParams::default());

    assert_eq!(stats.queries, 0);
    assert_eq!(view.visibility(bvh.root().unwrap()), Some(Visibility::Culled));
    assert!(view.issue(&bvh, &Unresolved).is_empty());
}

#[rstest]
#[case::corner(-2.0, 6.0)]
#[case::center(5.0, 11.0)]
#[case::everything(-1.0, 17.0)]
fn test_culled_nodes_draw_no_descendants(#[case] lo: f32, #[case] hi: f32) {
    let mut rng = seeded(11);
    let bvh = Bvh::build(
        random_squares(&mut rng, 300, 16.0),
        BuildParams::new(TreeStructure::Quadtree),
    );
    let mut view = View::new();
    view.schedule(
        &bvh,
        &top_down(lo, hi),
        &ScheduleParams::default().without_early_out(),
    );
    let batches = view.issue(&bvh, &Unresolved);

    for node in bvh.nodes() {
        if view.visibility(node.id()) != Some(Visibility::Culled) {
            continue;
        }
        let culled = node.objects();
        for batch in &batches {
            assert!(
                batch.objects.end <= culled.start || batch.objects.start >= culled.end,
                "batch {:?} overlaps culled node {:?}",
                batch.objects,
                culled
            );
        }
    }
}

#[test]
fn test_occluded_results_skip_draws() {
    let objects: Vec<Block<2>> = (0..16)
        .map(|i| square(i, (i % 4) as f32 + 0.5, (i / 4) as f32 + 0.5, 0.3))
        .collect();
    let bvh = Bvh::build(objects, BuildParams::new(TreeStructure::Quadtree));
    let mut view = View::new();
    view.schedule(
        &bvh,
        &top_down(-1.0, 5.0),
        &ScheduleParams::default().without_early_out(),
    );

    let everything_visible = vec![1u64; view.queries().len()];
    let nothing_visible = vec![0u64; view.queries().len()];
    let visible: usize = view
        .issue(&bvh, everything_visible.as_slice())
        .iter()
        .map(|b| b.objects.len())
        .sum();
    assert_eq!(visible, 16);
    assert!(view.issue(&bvh, nothing_visible.as_slice()).is_empty());
}

// ============================================================================
// Frame pacing
// ============================================================================

#[rstest]
fn test_completed_never_overtakes_current(#[values(1, 2, 3)] latency: usize) {
    let device = DummyDevice::with_manual_completion();
    let shared_device = shared(&device);
    let clock = Arc::new(FrameClock::new(shared_device.as_ref()).unwrap());
    let mut frames = FrameVersioning::<Vec<u64>>::new(shared_device, clock.clone(), latency);

    let mut rng = seeded(latency as u64);
    let mut last_completed = 0;
    for _ in 0..64 {
        frames.on_frame_start().unwrap();
        let finished = frames.on_frame_finish().unwrap();

        // The GPU trails by up to `latency - 1` frames, so the ring never blocks.
        let ahead = rng.random_range(0..latency as u64);
        device.complete_up_to((finished + 1 + ahead).saturating_sub(latency as u64));
        let completed = clock.completed_frame_id();
        assert!(completed <= clock.cur_frame_id());
        assert!(completed >= last_completed);
        last_completed = completed;
    }
    device.complete_all();
}

// ============================================================================
// Retirement
// ============================================================================

/// Records the frame it was retired at when dropped and checks the GPU is
/// done with it.
struct Token {
    frame_id: u64,
    clock: Arc<FrameClock>,
    freed: Arc<Mutex<Vec<u64>>>,
}

impl Drop for Token {
    fn drop(&mut self) {
        assert!(
            self.clock.completed_frame_id() >= self.frame_id,
            "resource of frame {} freed at completed frame {}",
            self.frame_id,
            self.clock.completed_frame_id()
        );
        self.freed.lock().push(self.frame_id);
    }
}

#[test]
fn test_retire_three_frames_complete_two() {
    let device = DummyDevice::with_manual_completion();
    let clock = Arc::new(FrameClock::new(&device).unwrap());
    let queue = RetirementQueue::new(clock.clone());
    let freed = Arc::new(Mutex::new(Vec::new()));

    for frame_id in [5, 6, 7] {
        let token = Token {
            frame_id,
            clock: clock.clone(),
            freed: freed.clone(),
        };
        assert!(queue.retire_at(frame_id, token));
    }

    device.signal(clock.fence(), 7).unwrap();
    device.complete_up_to(6);
    assert_eq!(queue.drain(), 2);
    assert_eq!(*freed.lock(), vec![5, 6]);
    assert_eq!(queue.pending_frames(), vec![7]);

    device.complete_all();
    assert_eq!(queue.drain(), 1);
    assert_eq!(*freed.lock(), vec![5, 6, 7]);
}

#[test]
fn test_retirement_safety_simulation() {
    init_logging();
    let device = DummyDevice::with_manual_completion();
    let shared_device = shared(&device);
    let clock = Arc::new(FrameClock::new(shared_device.as_ref()).unwrap());
    let queue = RetirementQueue::new(clock.clone());
    let mut frames = FrameVersioning::<Vec<u8>>::new(shared_device, clock.clone(), 3);
    let freed = Arc::new(Mutex::new(Vec::new()));
    let mut rng = seeded(99);

    for _ in 0..100 {
        frames.on_frame_start().unwrap();
        for _ in 0..rng.random_range(0..4) {
            queue.retire(Token {
                frame_id: clock.cur_frame_id(),
                clock: clock.clone(),
                freed: freed.clone(),
            });
        }
        let finished = frames.on_frame_finish().unwrap();
        // Keep the GPU at most two frames behind so the ring never blocks.
        let behind = rng.random_range(0..3u64);
        device.complete_up_to(finished.saturating_sub(behind));
        queue.drain();
    }

    device.complete_all();
    queue.drain();
    assert!(queue.is_empty());

    let freed = freed.lock();
    assert!(freed.windows(2).all(|w| w[0] <= w[1]), "drained out of frame order");
}
