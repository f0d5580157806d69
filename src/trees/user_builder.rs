//! Build entry point for callers that bring their own node type.
//!
//! The caller provides primitive references and callbacks creating its nodes and leaves; the
//! builder decides the topology and stores the caller's values in an arena.

use super::prim_ref::{PrimInfo, PrimRef};
use super::tree_binned_builder::{BinnedBuilder, BinnedSettings, BuildCallbacks, BuiltChild};
use super::tree_morton_builder::{MortonBuilder, MortonSettings};
use crate::config::{BuildQuality, DEFAULT_MAX_DEPTH};
use crate::error::{BuildError, Result};
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::memory::arena::{ArenaStorage, CachedAllocator, FastAllocator, Handle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Node construction hooks of [`build_user_bvh`].
pub trait UserCallbacks: Sync {
    type Node: Send;

    /// Creates an inner node that will get `child_count` children.
    fn create_node(&self, child_count: usize) -> Self::Node;

    /// Links the children of `node`, in order.
    fn set_node_children(&self, node: &mut Self::Node, children: &[Handle]);

    /// Stores the boxes of the children of `node`, in the same order as the children.
    fn set_node_bounds(&self, node: &mut Self::Node, bounds: &[BoundingBox]);

    fn create_leaf(&self, prims: &[PrimRef]) -> Self::Node;

    /// Splits a primitive's box at `position` along `axis`. Only used by high quality builds.
    fn split_primitive(&self, _prim: &PrimRef, _axis: usize, _position: f32) -> Option<(BoundingBox, BoundingBox)> {
        None
    }

    /// Reports that `placed` of `total` references are in leaves. `false` cancels the build.
    fn progress(&self, _placed: usize, _total: usize) -> bool {
        true
    }
}

/// Splits `bounds` into the parts below and above `position` on `axis`.
pub fn split_box(bounds: &BoundingBox, axis: usize, position: f32) -> (BoundingBox, BoundingBox) {
    let mut left = *bounds;
    let mut right = *bounds;
    left.max[axis] = position.min(bounds.max[axis]);
    right.min[axis] = position.max(bounds.min[axis]);
    (left, right)
}

/// Inputs of [`build_user_bvh`].
///
/// `primitives[..prim_count]` holds the references. High quality builds may append split
/// references into the remaining capacity.
pub struct BuildArguments<'a, C: UserCallbacks> {
    pub primitives: &'a mut [PrimRef],
    pub prim_count: usize,
    pub callbacks: &'a C,
    pub max_branching_factor: usize,
    pub min_leaf_size: usize,
    pub max_leaf_size: usize,
    pub traversal_cost: f32,
    pub intersection_cost: f32,
    pub max_depth: usize,
    pub quality: BuildQuality,
    pub presplit_factor: f32,
    pub presplit_budget: f32,
    pub max_bytes: usize,
}

impl<'a, C: UserCallbacks> BuildArguments<'a, C> {
    /// Arguments over all of `primitives` with default knobs.
    pub fn new(primitives: &'a mut [PrimRef], callbacks: &'a C) -> Self {
        let prim_count = primitives.len();
        Self {
            primitives,
            prim_count,
            callbacks,
            max_branching_factor: 2,
            min_leaf_size: 1,
            max_leaf_size: 8,
            traversal_cost: 1.0,
            intersection_cost: 1.0,
            max_depth: DEFAULT_MAX_DEPTH,
            quality: BuildQuality::Medium,
            presplit_factor: 4.0,
            presplit_budget: 0.25,
            max_bytes: usize::MAX,
        }
    }
}

/// Result of [`build_user_bvh`]: the caller's nodes in an arena plus the root handle.
pub struct UserBvh<U> {
    root: Option<Handle>,
    nodes: ArenaStorage<U>,
    prim_count: usize,
}

impl<U> UserBvh<U> {
    /// Root node. `None` when there were no primitives.
    pub fn root(&self) -> Option<Handle> {
        self.root
    }

    pub fn get(&self, handle: Handle) -> &U {
        &self.nodes[handle]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// References in the build, including pieces created by splitting.
    pub fn prim_count(&self) -> usize {
        self.prim_count
    }
}

/// Adapter between the generic builders and [`UserCallbacks`].
struct UserBuildCallbacks<'a, C: UserCallbacks> {
    user: &'a C,
    nodes: &'a FastAllocator<C::Node>,
    placed: AtomicUsize,
    total: usize,
}

impl<'a, C: UserCallbacks> BuildCallbacks for UserBuildCallbacks<'a, C> {
    type Node = Handle;
    type Alloc<'b>
        = CachedAllocator<'b, C::Node>
    where
        Self: 'b;

    fn cached_allocator(&self) -> Self::Alloc<'_> {
        self.nodes.get_cached_allocator()
    }

    fn create_node<'b>(&'b self, alloc: &mut Self::Alloc<'b>, children: &[BuiltChild<'_, Handle>]) -> Result<Handle> {
        let handles: Vec<Handle> = children.iter().map(|child| child.node).collect();
        let bounds: Vec<BoundingBox> = children.iter().map(|child| child.bounds).collect();
        let mut node = self.user.create_node(children.len());
        self.user.set_node_children(&mut node, &handles);
        self.user.set_node_bounds(&mut node, &bounds);
        alloc.alloc(node)
    }

    fn create_leaf<'b>(&'b self, alloc: &mut Self::Alloc<'b>, prims: &[PrimRef], _begin: usize) -> Result<Handle> {
        alloc.alloc(self.user.create_leaf(prims))
    }

    fn progress(&self, delta: usize) -> bool {
        let placed = self.placed.fetch_add(delta, Ordering::Relaxed) + delta;
        self.user.progress(placed, self.total)
    }
}

/// Splits oversized references in place, appending the upper pieces after `count`.
///
/// A reference is split at the middle of its longest axis while its half area exceeds
/// `factor` times the average. At most `budget` pieces are added. Returns the new count.
pub(crate) fn presplit<S>(prims: &mut [PrimRef], count: usize, factor: f32, budget: usize, split: S) -> usize
where
    S: Fn(&PrimRef, usize, f32) -> Option<(BoundingBox, BoundingBox)>,
{
    if count == 0 || budget == 0 {
        return count;
    }
    let average = prims[..count].iter().map(|p| p.bounds().half_area()).sum::<f32>() / count as f32;
    let threshold = average * factor;
    let mut end = count;
    let mut i = 0;
    while i < end {
        let prim = prims[i];
        let bounds = prim.bounds();
        let area = bounds.half_area();
        if area > threshold {
            if end - count == budget {
                log::warn!(
                    "presplit budget of {} references exhausted after {} of {} primitives",
                    budget,
                    i,
                    count
                );
                break;
            }
            let axis = bounds.largest_axis();
            let position = bounds.center()[axis];
            if let Some((left, right)) = split(&prim, axis, position) {
                let shrinks = left.half_area() < area && right.half_area() < area;
                if shrinks && left.is_valid() && right.is_valid() {
                    prims[i] = PrimRef::new(left, prim.geom_id, prim.prim_id);
                    prims[end] = PrimRef::new(right, prim.geom_id, prim.prim_id);
                    end += 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    log::debug!("presplit: {} references from {} primitives", end, count);
    end
}

/// Builds a hierarchy over `args.primitives[..args.prim_count]` out of the caller's nodes.
///
/// Low quality uses the Morton builder, medium the binned SAH builder, and high adds
/// pre-splitting of large primitives before the SAH build. Leaves see the references reordered
/// in `args.primitives`.
pub fn build_user_bvh<C: UserCallbacks>(args: BuildArguments<'_, C>) -> Result<UserBvh<C::Node>> {
    let BuildArguments {
        primitives,
        prim_count,
        callbacks,
        ..
    } = args;
    if primitives.len() < prim_count {
        return Err(BuildError::invalid_argument(
            "prim_count",
            format!("{} exceeds capacity {}", prim_count, primitives.len()),
        ));
    }
    if !(2..=32).contains(&args.max_branching_factor) {
        return Err(BuildError::invalid_argument("max_branching_factor", args.max_branching_factor));
    }
    if args.max_leaf_size == 0 || args.min_leaf_size == 0 || args.min_leaf_size > args.max_leaf_size {
        return Err(BuildError::invalid_argument(
            "leaf_size",
            format!("{}..={}", args.min_leaf_size, args.max_leaf_size),
        ));
    }
    if args.max_depth == 0 {
        return Err(BuildError::invalid_argument("max_depth", args.max_depth));
    }
    if !args.traversal_cost.is_finite() || args.traversal_cost <= 0.0 {
        return Err(BuildError::invalid_argument("traversal_cost", args.traversal_cost));
    }
    if !args.intersection_cost.is_finite() || args.intersection_cost <= 0.0 {
        return Err(BuildError::invalid_argument("intersection_cost", args.intersection_cost));
    }
    if !(args.presplit_factor.is_finite() && args.presplit_factor >= 1.0) {
        return Err(BuildError::invalid_argument("presplit_factor", args.presplit_factor));
    }
    let start = Instant::now();

    let count = match args.quality {
        BuildQuality::High => {
            let room = primitives.len() - prim_count;
            let budget = ((args.presplit_budget.max(0.0) * prim_count as f32) as usize).min(room);
            presplit(primitives, prim_count, args.presplit_factor, budget, |prim, axis, position| {
                callbacks.split_primitive(prim, axis, position)
            })
        }
        BuildQuality::Low | BuildQuality::Medium => prim_count,
    };
    let prims = &mut primitives[..count];
    if prims.is_empty() {
        return Ok(UserBvh {
            root: None,
            nodes: ArenaStorage::default(),
            prim_count: 0,
        });
    }

    let nodes = FastAllocator::new(args.max_bytes);
    nodes.init_estimate(count.div_ceil(args.max_leaf_size) * 2 * std::mem::size_of::<C::Node>());
    let single_thread_threshold =
        nodes.single_thread_threshold(args.max_branching_factor, count, count * std::mem::size_of::<C::Node>());
    let adapter = UserBuildCallbacks {
        user: callbacks,
        nodes: &nodes,
        placed: AtomicUsize::new(0),
        total: count,
    };
    let info = PrimInfo::from_prims(prims, 0);
    let root = match args.quality {
        BuildQuality::Low => {
            let builder = MortonBuilder::new(
                &adapter,
                MortonSettings {
                    branching_factor: args.max_branching_factor,
                    max_leaf_size: args.max_leaf_size,
                    max_depth: args.max_depth,
                    single_thread_threshold,
                },
            );
            let (root, sorted) = builder.build(prims.to_vec(), info)?;
            prims.copy_from_slice(&sorted);
            root
        }
        BuildQuality::Medium | BuildQuality::High => {
            let builder = BinnedBuilder::new(
                &adapter,
                BinnedSettings {
                    branching_factor: args.max_branching_factor,
                    min_leaf_size: args.min_leaf_size,
                    max_leaf_size: args.max_leaf_size,
                    traversal_cost: args.traversal_cost,
                    intersection_cost: args.intersection_cost,
                    max_depth: args.max_depth,
                    log_block_size: 0,
                    single_thread_threshold,
                },
            );
            builder.build(prims, info)?
        }
    };
    drop(adapter);
    log::info!(
        "user bvh: {} quality, {} references in {:.2?}",
        args.quality,
        count,
        start.elapsed()
    );
    Ok(UserBvh {
        root: Some(root),
        nodes: nodes.into_storage(),
        prim_count: count,
    })
}
