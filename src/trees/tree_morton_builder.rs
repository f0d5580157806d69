//! Linear builder: sorts references along a Morton curve and splits ranges at the highest
//! differing code bit.

use super::prim_ref::{PrimInfo, PrimRef};
use super::tree_binned_builder::{BuildCallbacks, BuiltChild};
use crate::error::{BuildError, Result};
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::collections::lsb_radix_sort::sort_u64;
use crate::utilities::thread_dispatcher::map_if;
use glam::Vec3;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Bits per axis of a Morton code.
pub const MORTON_BITS_PER_AXIS: u32 = 10;
const MORTON_GRID_MAX: f32 = ((1 << MORTON_BITS_PER_AXIS) - 1) as f32;

/// Knobs of [`MortonBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MortonSettings {
    pub branching_factor: usize,
    pub max_leaf_size: usize,
    pub max_depth: usize,
    pub single_thread_threshold: usize,
}

impl Default for MortonSettings {
    fn default() -> Self {
        Self {
            branching_factor: 4,
            max_leaf_size: 8,
            max_depth: crate::config::DEFAULT_MAX_DEPTH,
            single_thread_threshold: 1024,
        }
    }
}

/// Spreads the low 10 bits of `v` so that two zero bits separate each of them.
#[inline(always)]
fn expand_bits(v: u32) -> u32 {
    let mut v = v & 0x3ff;
    v = (v | (v << 16)) & 0x030000ff;
    v = (v | (v << 8)) & 0x0300f00f;
    v = (v | (v << 4)) & 0x030c30c3;
    v = (v | (v << 2)) & 0x09249249;
    v
}

/// Quantizes points inside a box onto the Morton grid.
#[derive(Clone, Copy, Debug)]
pub struct MortonMapping {
    offset: Vec3,
    scale: Vec3,
}

impl MortonMapping {
    /// Mapping of the doubled centroids described by `cent_bounds`.
    pub fn new(cent_bounds: &BoundingBox) -> Self {
        let extent = cent_bounds.size();
        let scale = Vec3::select(
            extent.cmpgt(Vec3::splat(1e-34)),
            Vec3::splat(MORTON_GRID_MAX) / extent,
            Vec3::ZERO,
        );
        Self {
            offset: cent_bounds.min,
            scale,
        }
    }

    /// 30 bit interleaved code of a doubled centroid.
    #[inline]
    pub fn code(&self, center2: Vec3) -> u32 {
        let grid = ((center2 - self.offset) * self.scale).clamp(Vec3::ZERO, Vec3::splat(MORTON_GRID_MAX));
        (expand_bits(grid.x as u32) << 2) | (expand_bits(grid.y as u32) << 1) | expand_bits(grid.z as u32)
    }
}

/// Code of every reference in the upper half of a key, its index in the lower half.
fn compute_keys(prims: &[PrimRef], mapping: &MortonMapping) -> Vec<u64> {
    prims
        .par_iter()
        .enumerate()
        .map(|(i, prim)| (mapping.code(prim.center2()) as u64) << 32 | i as u64)
        .collect()
}

/// First index of the upper half when splitting sorted `codes`.
///
/// Splits at the highest bit in which the first and last code differ. Ranges sharing one code
/// are split at the median.
pub fn split_position(codes: &[u32]) -> usize {
    debug_assert!(codes.len() >= 2, "Only ranges of two or more codes can be split.");
    let first = codes[0];
    let last = codes[codes.len() - 1];
    if first == last {
        return codes.len() / 2;
    }
    let bit = 31 - (first ^ last).leading_zeros();
    codes.partition_point(|&code| code & (1 << bit) == 0)
}

fn bounds_of(prims: &[PrimRef]) -> BoundingBox {
    prims
        .iter()
        .fold(BoundingBox::EMPTY, |acc, prim| acc.merge(&prim.bounds()))
}

/// Morton code builder over arbitrary [`BuildCallbacks`].
pub struct MortonBuilder<'c, C: BuildCallbacks> {
    callbacks: &'c C,
    settings: MortonSettings,
    warned_depth: AtomicBool,
}

impl<'c, C: BuildCallbacks> MortonBuilder<'c, C> {
    pub fn new(callbacks: &'c C, settings: MortonSettings) -> Self {
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

    /// Builds the hierarchy over `prims`. Returns the root and the references in Morton order,
    /// which is the order leaf offsets refer to.
    pub fn build(&self, prims: Vec<PrimRef>, info: PrimInfo) -> Result<(C::Node, Vec<PrimRef>)> {
        debug_assert_eq!(info.size(), prims.len(), "Info must cover the whole array.");
        let mapping = MortonMapping::new(&info.cent_bounds());
        let mut keys = compute_keys(&prims, &mapping);
        let mut scratch = vec![0u64; keys.len()];
        sort_u64(&mut keys, &mut scratch);

        let sorted: Vec<PrimRef> = keys
            .par_iter()
            .map(|&key| prims[(key & 0xffff_ffff) as usize])
            .collect();
        let codes: Vec<u32> = keys.par_iter().map(|&key| (key >> 32) as u32).collect();
        drop(prims);

        let (root, bounds) = self.recurse(&sorted, &codes, 0, 0)?;
        debug_assert!(
            bounds == info.geom_bounds(),
            "Morton tree bounds must match the reference bounds."
        );
        Ok((root, sorted))
    }

    fn create_leaf(&self, prims: &[PrimRef], begin: usize) -> Result<C::Node> {
        let mut alloc = self.callbacks.cached_allocator();
        let node = self.callbacks.create_leaf(&mut alloc, prims, begin)?;
        if !self.callbacks.progress(prims.len()) {
            return Err(BuildError::Cancelled);
        }
        Ok(node)
    }

    /// Leaves below the depth cap. Oversized ranges are chunked under extra inner nodes.
    fn create_large_leaf(&self, prims: &[PrimRef], begin: usize) -> Result<(C::Node, BoundingBox)> {
        let bounds = bounds_of(prims);
        if prims.len() <= self.settings.max_leaf_size {
            return Ok((self.create_leaf(prims, begin)?, bounds));
        }
        if !self.warned_depth.swap(true, Ordering::Relaxed) {
            log::warn!(
                "morton: depth cap {} reached with {} references, forcing oversized leaves",
                self.settings.max_depth,
                prims.len()
            );
        }
        let chunk_size = prims
            .len()
            .div_ceil(self.settings.branching_factor)
            .max(self.settings.max_leaf_size);
        let mut children = Vec::with_capacity(self.settings.branching_factor);
        for (i, chunk) in prims.chunks(chunk_size).enumerate() {
            let chunk_begin = begin + i * chunk_size;
            let (node, chunk_bounds) = self.create_large_leaf(chunk, chunk_begin)?;
            children.push(BuiltChild {
                node,
                bounds: chunk_bounds,
                prims: chunk,
                begin: chunk_begin,
            });
        }
        let mut alloc = self.callbacks.cached_allocator();
        Ok((self.callbacks.create_node(&mut alloc, &children)?, bounds))
    }

    /// Builds the subtree over `prims`, which start at `begin` in the sorted array.
    fn recurse(&self, prims: &[PrimRef], codes: &[u32], begin: usize, depth: usize) -> Result<(C::Node, BoundingBox)> {
        let settings = &self.settings;
        let size = prims.len();
        if size <= settings.max_leaf_size {
            return Ok((self.create_leaf(prims, begin)?, bounds_of(prims)));
        }
        if depth >= settings.max_depth {
            return self.create_large_leaf(prims, begin);
        }

        // Collapse binary splits into one wide node, opening the largest child first.
        let mut ranges = vec![0..size];
        while ranges.len() < settings.branching_factor {
            let candidate = ranges
                .iter()
                .enumerate()
                .filter(|(_, range)| range.len() > settings.max_leaf_size)
                .max_by_key(|(_, range)| range.len())
                .map(|(i, _)| i);
            let Some(index) = candidate else {
                break;
            };
            let range = ranges[index].clone();
            let mid = range.start + split_position(&codes[range.clone()]);
            ranges[index] = range.start..mid;
            ranges.insert(index + 1, mid..range.end);
        }

        let parallel = size > settings.single_thread_threshold;
        if parallel {
            log::trace!(
                "morton: forking {} children over {} references at depth {}",
                ranges.len(),
                size,
                depth
            );
        }
        let built = map_if(parallel, ranges.clone(), |range| {
            self.recurse(&prims[range.clone()], &codes[range.clone()], begin + range.start, depth + 1)
        });

        let mut children = Vec::with_capacity(ranges.len());
        let mut bounds = BoundingBox::EMPTY;
        for (range, result) in ranges.into_iter().zip(built) {
            let (node, child_bounds) = result?;
            bounds.extend_box(&child_bounds);
            children.push(BuiltChild {
                node,
                bounds: child_bounds,
                prims: &prims[range.clone()],
                begin: begin + range.start,
            });
        }
        let mut alloc = self.callbacks.cached_allocator();
        Ok((self.callbacks.create_node(&mut alloc, &children)?, bounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::tree_binned_builder::tests::RecordingCallbacks;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_prims(count: usize, seed: u64) -> Vec<PrimRef> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|i| {
                let c = Vec3::new(rng.gen(), rng.gen(), rng.gen()) * 100.0;
                PrimRef::new(BoundingBox::new(c, c + 0.5), 0, i as u32)
            })
            .collect()
    }

    #[test]
    fn test_expand_bits() {
        assert_eq!(expand_bits(0b1), 0b1);
        assert_eq!(expand_bits(0b11), 0b1001);
        assert_eq!(expand_bits(0x3ff), 0x09249249);
    }

    #[test]
    fn test_codes_follow_grid_order() {
        let mapping = MortonMapping::new(&BoundingBox::new(Vec3::ZERO, Vec3::splat(2.0)));
        assert_eq!(mapping.code(Vec3::ZERO), 0);
        assert_eq!(mapping.code(Vec3::splat(2.0)), (1 << 30) - 1);
        // x owns the most significant bit of each triple.
        assert!(mapping.code(Vec3::new(2.0, 0.0, 0.0)) > mapping.code(Vec3::new(0.0, 2.0, 2.0)));
    }

    #[test]
    fn test_split_position() {
        assert_eq!(split_position(&[0b000, 0b001, 0b100, 0b110]), 2);
        assert_eq!(split_position(&[0b010, 0b011, 0b011]), 1);
        assert_eq!(split_position(&[5, 5, 5, 5, 5]), 2);
    }

    #[test]
    fn test_every_reference_in_exactly_one_leaf() {
        let prims = random_prims(3000, 7);
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks::default();
        let settings = MortonSettings {
            single_thread_threshold: 128,
            ..Default::default()
        };
        let (_, sorted) = MortonBuilder::new(&callbacks, settings).build(prims, info).unwrap();

        let leaves = callbacks.leaves.into_inner().unwrap();
        let mut ids: Vec<u32> = leaves.iter().flat_map(|(_, ids)| ids.clone()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..3000).collect::<Vec<u32>>());
        for (begin, ids) in &leaves {
            assert!(!ids.is_empty() && ids.len() <= settings.max_leaf_size);
            let expected: Vec<u32> = sorted[*begin..begin + ids.len()].iter().map(|p| p.prim_id).collect();
            assert_eq!(&expected, ids);
        }
        let nodes = callbacks.nodes.into_inner().unwrap();
        assert!(nodes.iter().all(|children| children.len() >= 2 && children.len() <= 4));
    }

    #[test]
    fn test_identical_codes_split_at_median() {
        let prim = PrimRef::new(BoundingBox::new(Vec3::ZERO, Vec3::ONE), 0, 0);
        let prims: Vec<PrimRef> = (0..100).map(|i| PrimRef { prim_id: i, ..prim }).collect();
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks::default();
        MortonBuilder::new(&callbacks, MortonSettings::default())
            .build(prims, info)
            .unwrap();
        let leaves = callbacks.leaves.into_inner().unwrap();
        assert_eq!(leaves.iter().map(|(_, ids)| ids.len()).sum::<usize>(), 100);
        assert!(leaves.iter().all(|(_, ids)| ids.len() <= 8));
    }

    #[test]
    fn test_depth_cap_forces_leaves() {
        let prims = random_prims(500, 3);
        let info = PrimInfo::from_prims(&prims, 0);
        let callbacks = RecordingCallbacks::default();
        let settings = MortonSettings {
            max_depth: 1,
            max_leaf_size: 4,
            ..Default::default()
        };
        MortonBuilder::new(&callbacks, settings).build(prims, info).unwrap();
        let leaves = callbacks.leaves.into_inner().unwrap();
        assert_eq!(leaves.iter().map(|(_, ids)| ids.len()).sum::<usize>(), 500);
        assert!(leaves.iter().all(|(_, ids)| ids.len() <= 4));
    }
}
