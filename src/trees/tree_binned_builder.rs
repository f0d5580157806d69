//! Generic top-down builder partitioning primitive references with a binned SAH.
//!
//! The builder knows nothing about node layouts: it hands finished children to
//! [`BuildCallbacks`], which allocate and fill whatever node type the caller uses.

use super::prim_ref::{blocks, PrimInfo, PrimRef};
use crate::error::{BuildError, Result};
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::thread_dispatcher::map_if;
use glam::Vec3;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum number of bins per axis.
pub const BIN_COUNT: usize = 32;
/// Ranges above this size are binned in parallel.
const PARALLEL_BINNING_THRESHOLD: usize = 4 * 1024;
const BINNING_CHUNK: usize = 1024;

/// A finished subtree handed to [`BuildCallbacks::create_node`].
pub struct BuiltChild<'p, T> {
    pub node: T,
    pub bounds: BoundingBox,
    /// References below this child.
    pub prims: &'p [PrimRef],
    /// Offset of `prims` in the full reference array.
    pub begin: usize,
}

/// Node allocation and construction hooks of a builder.
pub trait BuildCallbacks: Sync {
    type Node: Copy + Send;
    /// Per-thread allocation state, fetched right before creating nodes or leaves.
    type Alloc<'a>
    where
        Self: 'a;

    fn cached_allocator(&self) -> Self::Alloc<'_>;

    /// Creates an inner node over already built children, in order.
    fn create_node<'a>(
        &'a self,
        alloc: &mut Self::Alloc<'a>,
        children: &[BuiltChild<'_, Self::Node>],
    ) -> Result<Self::Node>;

    /// Creates a leaf for `prims`, which start at `begin` in the full reference array.
    fn create_leaf<'a>(
        &'a self,
        alloc: &mut Self::Alloc<'a>,
        prims: &[PrimRef],
        begin: usize,
    ) -> Result<Self::Node>;

    /// Reports `delta` more references placed in leaves. Returning `false` cancels the build.
    fn progress(&self, _delta: usize) -> bool {
        true
    }
}

/// Knobs of [`BinnedBuilder`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinnedSettings {
    pub branching_factor: usize,
    pub min_leaf_size: usize,
    pub max_leaf_size: usize,
    pub traversal_cost: f32,
    pub intersection_cost: f32,
    pub max_depth: usize,
    pub log_block_size: u32,
    pub single_thread_threshold: usize,
}

impl Default for BinnedSettings {
    fn default() -> Self {
        Self {
            branching_factor: 4,
            min_leaf_size: 1,
            max_leaf_size: 8,
            traversal_cost: 1.0,
            intersection_cost: 1.0,
            max_depth: crate::config::DEFAULT_MAX_DEPTH,
            log_block_size: 0,
            single_thread_threshold: 1024,
        }
    }
}

/// Maps doubled centroids to bin indices.
#[derive(Clone, Copy, Debug)]
pub struct BinMapping {
    pub bin_count: usize,
    offset: Vec3,
    scale: Vec3,
}

impl BinMapping {
    pub fn new(info: &PrimInfo) -> Self {
        let bin_count = BIN_COUNT.min(4 + (0.05 * info.size() as f32) as usize);
        let cent_bounds = info.cent_bounds();
        let extent = cent_bounds.size();
        let scale = Vec3::select(
            extent.cmpgt(Vec3::splat(1e-34)),
            Vec3::splat(bin_count as f32 * 0.99) / extent,
            Vec3::ZERO,
        );
        Self {
            bin_count,
            offset: cent_bounds.min,
            scale,
        }
    }

    /// Bin of `prim` on every axis.
    #[inline(always)]
    pub fn bin(&self, prim: &PrimRef) -> [usize; 3] {
        let b = ((prim.center2() - self.offset) * self.scale).floor();
        let max = (self.bin_count - 1) as f32;
        [
            b.x.clamp(0.0, max) as usize,
            b.y.clamp(0.0, max) as usize,
            b.z.clamp(0.0, max) as usize,
        ]
    }

    /// Whether any axis can separate primitives at all.
    pub fn is_valid(&self) -> bool {
        self.scale.cmpgt(Vec3::ZERO).any()
    }
}

/// Per-axis bin boxes and counts.
#[derive(Clone, Debug)]
pub struct BinInfo {
    bounds: [[BoundingBox; BIN_COUNT]; 3],
    counts: [[usize; BIN_COUNT]; 3],
}

impl Default for BinInfo {
    fn default() -> Self {
        Self {
            bounds: [[BoundingBox::EMPTY; BIN_COUNT]; 3],
            counts: [[0; BIN_COUNT]; 3],
        }
    }
}

impl BinInfo {
    pub fn bin(&mut self, prims: &[PrimRef], mapping: &BinMapping) {
        for prim in prims {
            let bins = mapping.bin(prim);
            let bounds = prim.bounds();
            for axis in 0..3 {
                self.bounds[axis][bins[axis]].extend_box(&bounds);
                self.counts[axis][bins[axis]] += 1;
            }
        }
    }

    /// Bins in parallel chunks for large ranges.
    pub fn bin_parallel(prims: &[PrimRef], mapping: &BinMapping, parallel: bool) -> Self {
        if !parallel || prims.len() < PARALLEL_BINNING_THRESHOLD {
            let mut info = Self::default();
            info.bin(prims, mapping);
            return info;
        }
        prims
            .par_chunks(BINNING_CHUNK)
            .map(|chunk| {
                let mut info = Self::default();
                info.bin(chunk, mapping);
                info
            })
            .reduce(Self::default, |a, b| a.merge(&b))
    }

    pub fn merge(&self, other: &BinInfo) -> Self {
        let mut merged = self.clone();
        for axis in 0..3 {
            for i in 0..BIN_COUNT {
                merged.bounds[axis][i].extend_box(&other.bounds[axis][i]);
                merged.counts[axis][i] += other.counts[axis][i];
            }
        }
        merged
    }

    /// Finds the cheapest bin boundary over all axes.
    pub fn best(&self, mapping: &BinMapping, settings: &BinnedSettings, parent_area: f32) -> Option<Split> {
        let n = mapping.bin_count;
        let mut best: Option<Split> = None;
        for axis in 0..3 {
            if mapping.scale[axis] == 0.0 {
                continue;
            }
            // Right sweep: area and count of bins [i, n).
            let mut right_areas = [0.0f32; BIN_COUNT];
            let mut right_counts = [0usize; BIN_COUNT];
            let mut bounds = BoundingBox::EMPTY;
            let mut count = 0;
            for i in (1..n).rev() {
                bounds.extend_box(&self.bounds[axis][i]);
                count += self.counts[axis][i];
                right_areas[i] = bounds.half_area();
                right_counts[i] = count;
            }
            // Left sweep, evaluating the split in front of bin i.
            let mut bounds = BoundingBox::EMPTY;
            let mut count = 0;
            for i in 1..n {
                bounds.extend_box(&self.bounds[axis][i - 1]);
                count += self.counts[axis][i - 1];
                if count == 0 || right_counts[i] == 0 {
                    continue;
                }
                let cost = bounds.half_area() * blocks(count, settings.log_block_size) as f32
                    + right_areas[i] * blocks(right_counts[i], settings.log_block_size) as f32;
                let sah = settings.traversal_cost * parent_area + settings.intersection_cost * cost;
                if best.map_or(true, |b| sah < b.sah) {
                    best = Some(Split {
                        axis,
                        pos: i,
                        sah,
                        mapping: *mapping,
                    });
                }
            }
        }
        best
    }
}

/// A bin boundary on one axis: primitives in bins below `pos` go left.
#[derive(Clone, Copy, Debug)]
pub struct Split {
    pub axis: usize,
    pub pos: usize,
    /// Unnormalized SAH cost of splitting here.
    pub sah: f32,
    pub mapping: BinMapping,
}

/// Finds the best binned split of `prims` described by `info`.
pub fn find_split(prims: &[PrimRef], info: &PrimInfo, settings: &BinnedSettings, parallel: bool) -> Option<Split> {
    let mapping = BinMapping::new(info);
    if !mapping.is_valid() {
        return None;
    }
    let bins = BinInfo::bin_parallel(prims, &mapping, parallel);
    bins.best(&mapping, settings, info.geom_bounds().half_area())
}

/// Partitions `prims` (starting at `begin`) in place by `split`. Returns `None` when one side
/// would be empty.
pub fn partition(prims: &mut [PrimRef], begin: usize, split: &Split) -> Option<(PrimInfo, PrimInfo)> {
    let mut left = PrimInfo::empty(begin);
    let mut i = 0;
    let mut j = prims.len();
    while i < j {
        if split.mapping.bin(&prims[i])[split.axis] < split.pos {
            left.add(&prims[i]);
            i += 1;
        } else {
            j -= 1;
            prims.swap(i, j);
        }
    }
    if i == 0 || i == prims.len() {
        return None;
    }
    let right = PrimInfo::from_prims(&prims[i..], begin + i);
    Some((left, right))
}

/// Object median split along the longest centroid axis.
pub fn median_split(prims: &mut [PrimRef], info: &PrimInfo) -> (PrimInfo, PrimInfo) {
    debug_assert!(prims.len() >= 2, "A median split needs at least two references.");
    let axis = info.cent_bounds().largest_axis();
    let mid = prims.len() / 2;
    prims.select_nth_unstable_by(mid, |a, b| a.center2()[axis].total_cmp(&b.center2()[axis]));
    (
        PrimInfo::from_prims(&prims[..mid], info.begin),
        PrimInfo::from_prims(&prims[mid..], info.begin + mid),
    )
}

/// Binned SAH builder. See the module documentation.
pub struct BinnedBuilder<'c, C: BuildCallbacks> {
    callbacks: &'c C,
    settings: BinnedSettings,
    warned_depth: AtomicBool,
}

impl<'c, C: BuildCallbacks> BinnedBuilder<'c, C> {
    pub fn new(callbacks: &'c C, settings: BinnedSettings) -> Self {
        debug_assert!(
            settings.branching_factor >= 2,
            "Nodes need at least two children."
        );
        Self {
            callbacks,
            settings,
            warned_depth: AtomicBool::new(false),
        }
    }

    /// Builds the hierarchy over `prims`, reordering them so that every leaf is contiguous.
    /// `info` must describe all of `prims`, starting at 0.
    pub fn build(&self, prims: &mut [PrimRef], info: PrimInfo) -> Result<C::Node> {
        debug_assert_eq!(info.size(), prims.len(), "Info must cover the whole array.");
        self.recurse(prims, info, 0)
    }

    fn create_leaf(&self, prims: &[PrimRef], info: &PrimInfo) -> Result<C::Node> {
        let mut alloc = self.callbacks.cached_allocator();
        let node = self.callbacks.create_leaf(&mut alloc, prims, info.begin)?;
        if !self.callbacks.progress(prims.len()) {
            return Err(BuildError::Cancelled);
        }
        Ok(node)
    }

    /// Leaf at the depth cap. Oversized ranges are chunked into leaves below extra inner nodes.
    fn create_large_leaf(&self, prims: &[PrimRef], info: PrimInfo) -> Result<C::Node> {
        let max_leaf = self.settings.max_leaf_size;
        if prims.len() <= max_leaf {
            return self.create_leaf(prims, &info);
        }
        if !self.warned_depth.swap(true, Ordering::Relaxed) {
            log::warn!(
                "depth cap {} reached with {} references, forcing oversized leaves",
                self.settings.max_depth,
                prims.len()
            );
        }
        let chunk_size = prims.len().div_ceil(self.settings.branching_factor).max(max_leaf);
        let mut children = Vec::with_capacity(self.settings.branching_factor);
        for (i, chunk) in prims.chunks(chunk_size).enumerate() {
            let chunk_info = PrimInfo::from_prims(chunk, info.begin + i * chunk_size);
            let node = self.create_large_leaf(chunk, chunk_info)?;
            children.push(BuiltChild {
                node,
                bounds: chunk_info.geom_bounds(),
                prims: chunk,
                begin: chunk_info.begin,
            });
        }
        let mut alloc = self.callbacks.cached_allocator();
        self.callbacks.create_node(&mut alloc, &children)
    }

    /// Splits `info` in two, by SAH when possible and by object median otherwise.
    fn split(&self, prims: &mut [PrimRef], info: &PrimInfo, split: Option<Split>) -> (PrimInfo, PrimInfo) {
        split
            .and_then(|split| partition(prims, info.begin, &split))
            .unwrap_or_else(|| median_split(prims, info))
    }

    fn recurse(&self, prims: &mut [PrimRef], info: PrimInfo, depth: usize) -> Result<C::Node> {
        let settings = &self.settings;
        let size = info.size();
        if size <= settings.min_leaf_size || size == 1 {
            return self.create_leaf(prims, &info);
        }
        if depth >= settings.max_depth {
            return self.create_large_leaf(prims, info);
        }
        let parallel = size > settings.single_thread_threshold;

        let split = find_split(prims, &info, settings, parallel);
        if size <= settings.max_leaf_size {
            let leaf_sah = settings.intersection_cost * info.leaf_sah(settings.log_block_size);
            if split.map_or(true, |split| split.sah >= leaf_sah) {
                return self.create_leaf(prims, &info);
            }
        }

        // Open children until the node is full, always splitting the largest one.
        let (left, right) = self.split(prims, &info, split);
        let mut children = vec![left, right];
        while children.len() < settings.branching_factor {
            let candidate = children
                .iter()
                .enumerate()
                .filter(|(_, child)| child.size() > settings.min_leaf_size && child.size() > 1)
                .max_by(|(_, a), (_, b)| {
                    a.geom_bounds()
                        .half_area()
                        .total_cmp(&b.geom_bounds().half_area())
                })
                .map(|(i, _)| i);
            let Some(index) = candidate else {
                break;
            };
            let child = children[index];
            let child_prims = &mut prims[child.begin - info.begin..child.end - info.begin];
            let child_split = find_split(child_prims, &child, settings, parallel);
            let (left, right) = self.split(child_prims, &child, child_split);
            children[index] = left;
            children.insert(index + 1, right);
        }

        // Hand every child its own disjoint slice.
        let mut tasks = Vec::with_capacity(children.len());
        let mut rest: &mut [PrimRef] = prims;
        for child in &children {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(child.size());
            rest = tail;
            tasks.push((*child, head));
        }
        if parallel {
            log::trace!(
                "sah: forking {} children over {} references at depth {}",
                tasks.len(),
                size,
                depth
            );
        }
        let nodes = map_if(parallel, tasks, |(child, child_prims)| {
            self.recurse(child_prims, child, depth + 1)
        });

        let prims: &[PrimRef] = prims;
        let mut built = Vec::with_capacity(children.len());
        for (child, node) in children.iter().zip(nodes) {
            built.push(BuiltChild {
                node: node?,
                bounds: child.geom_bounds(),
                prims: &prims[child.begin - info.begin..child.end - info.begin],
                begin: child.begin,
            });
        }
        let mut alloc = self.callbacks.cached_allocator();
        self.callbacks.create_node(&mut alloc, &built)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Records the tree shape in plain vectors.
    #[derive(Default)]
    pub(crate) struct RecordingCallbacks {
        pub nodes: Mutex<Vec<Vec<(usize, BoundingBox)>>>,
        pub leaves: Mutex<Vec<(usize, Vec<u32>)>>,
        pub placed: AtomicUsize,
        pub cancel_after: Option<usize>,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(crate) enum Recorded {
        Node(usize),
        Leaf(usize),
    }

    impl BuildCallbacks for RecordingCallbacks {
        type Node = Recorded;
        type Alloc<'a>
            = ()
        where
            Self: 'a;

        fn cached_allocator(&self) -> Self::Alloc<'_> {}

        fn create_node<'a>(&'a self, _: &mut Self::Alloc<'a>, children: &[BuiltChild<'_, Recorded>]) -> Result<Recorded> {
            let mut nodes = self.nodes.lock().unwrap();
            let entry = children
                .iter()
                .map(|c| (c.prims.len(), c.bounds))
                .collect();
            nodes.push(entry);
            Ok(Recorded::Node(nodes.len() - 1))
        }

        fn create_leaf<'a>(&'a self, _: &mut Self::Alloc<'a>, prims: &[PrimRef], begin: usize) -> Result<Recorded> {
            let mut leaves = self.leaves.lock().unwrap();
            leaves.push((begin, prims.iter().map(|p| p.prim_id).collect()));
            Ok(Recorded::Leaf(leaves.len() - 1))
        }

        fn progress(&self, delta: usize) -> bool {
            let placed = self.placed.fetch_add(delta, Ordering::Relaxed) + delta;
            self.cancel_after.map_or(true, |limit| placed <= limit)
        }
    }

    fn line_of_prims(count: usize) -> Vec<PrimRef> {
        (0..count)
            .map(|i| {
                let c = Vec3::new(i as f32 * 3.0 % 101.0, (i % 7) as f32, (i % 3) as f32);
                PrimRef::new(BoundingBox::new(c, c + 0.5), 0, i as u32)
            })
            .collect()
    }

    #[test]
    fn test_every_reference_in_exactly_one_leaf() {
        let mut prims = line_of_prims(2000);
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks::default();
        let settings = BinnedSettings {
            single_thread_threshold: 64,
            ..Default::default()
        };
        BinnedBuilder::new(&callbacks, settings).build(&mut prims, info).unwrap();

        let leaves = callbacks.leaves.into_inner().unwrap();
        let mut ids: Vec<u32> = leaves.iter().flat_map(|(_, ids)| ids.clone()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..2000).collect::<Vec<u32>>());
        for (begin, ids) in &leaves {
            assert!(ids.len() <= settings.max_leaf_size);
            // Leaves are contiguous in the reordered array.
            let expected: Vec<u32> = prims[*begin..begin + ids.len()].iter().map(|p| p.prim_id).collect();
            assert_eq!(&expected, ids);
        }
        let nodes = callbacks.nodes.into_inner().unwrap();
        assert!(nodes.iter().all(|children| children.len() >= 2 && children.len() <= 4));
    }

    #[test]
    fn test_depth_cap_forces_leaves() {
        let mut prims = line_of_prims(100);
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks::default();
        let settings = BinnedSettings {
            max_depth: 1,
            max_leaf_size: 4,
            ..Default::default()
        };
        BinnedBuilder::new(&callbacks, settings).build(&mut prims, info).unwrap();
        let leaves = callbacks.leaves.into_inner().unwrap();
        assert_eq!(leaves.iter().map(|(_, ids)| ids.len()).sum::<usize>(), 100);
        assert!(leaves.iter().all(|(_, ids)| ids.len() <= 4));
    }

    #[test]
    fn test_identical_centroids_fall_back_to_median() {
        let prim = PrimRef::new(BoundingBox::new(Vec3::ZERO, Vec3::ONE), 0, 0);
        let mut prims: Vec<PrimRef> = (0..50).map(|i| PrimRef { prim_id: i, ..prim }).collect();
        let info = PrimInfo::from_prims(&prims, 0);
        assert!(find_split(&prims, &info, &BinnedSettings::default(), false).is_none());
        let callbacks = RecordingCallbacks::default();
        BinnedBuilder::new(&callbacks, BinnedSettings::default())
            .build(&mut prims, info)
            .unwrap();
        let leaves = callbacks.leaves.into_inner().unwrap();
        assert_eq!(leaves.iter().map(|(_, ids)| ids.len()).sum::<usize>(), 50);
        assert!(leaves.iter().all(|(_, ids)| ids.len() <= 8));
    }

    #[test]
    fn test_sah_prefers_clustered_split() {
        // Two far apart clusters must end up in different children of the root.
        let mut prims: Vec<PrimRef> = (0..16)
            .map(|i| {
                let x = if i < 8 { i as f32 * 0.1 } else { 100.0 + i as f32 * 0.1 };
                PrimRef::new(BoundingBox::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 0.1, 1.0, 1.0)), 0, i)
            })
            .collect();
        let info = PrimInfo::from_prims(&prims, 0);
        let split = find_split(&prims, &info, &BinnedSettings::default(), false).unwrap();
        assert_eq!(split.axis, 0);
        let (left, right) = partition(&mut prims, 0, &split).unwrap();
        assert_eq!((left.size(), right.size()), (8, 8));
        assert!(left.geom_bounds().max.x < 2.0);
    }

    #[test]
    fn test_progress_can_cancel() {
        let mut prims = line_of_prims(500);
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks {
            cancel_after: Some(100),
            ..Default::default()
        };
        let result = BinnedBuilder::new(&callbacks, BinnedSettings::default()).build(&mut prims, info);
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }
}
