//! Parallel construction of the primitive reference array from a scene.

use super::prim_ref::{PrimInfo, PrimRef};
use crate::scene::GeometryProvider;
use rayon::prelude::*;

/// Number of primitives scanned by one task.
pub const PRIM_REF_CHUNK: usize = 1024;

/// Maps a flat primitive index to `(geom_id, prim_id)`.
struct PrimIndexSpace {
    /// `offsets[g]` is the flat index of the first primitive of geometry `g`; one extra end entry.
    offsets: Vec<usize>,
}

impl PrimIndexSpace {
    fn new(scene: &dyn GeometryProvider) -> Self {
        let mut offsets = Vec::with_capacity(scene.geometry_count() + 1);
        let mut total = 0;
        for geom_id in 0..scene.geometry_count() as u32 {
            offsets.push(total);
            total += scene.geometry(geom_id).map_or(0, |g| g.prim_count());
        }
        offsets.push(total);
        Self { offsets }
    }

    fn total(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Calls `visit(geom_id, prim_id)` for every primitive in the flat range, in order.
    fn for_each_in(&self, range: std::ops::Range<usize>, mut visit: impl FnMut(u32, u32)) {
        // Last geometry whose first primitive is at or before the range start.
        let mut geom = self.offsets.partition_point(|&offset| offset <= range.start) - 1;
        let mut index = range.start;
        while index < range.end {
            while self.offsets[geom + 1] <= index {
                geom += 1;
            }
            let geom_end = self.offsets[geom + 1].min(range.end);
            for flat in index..geom_end {
                visit(geom as u32, (flat - self.offsets[geom]) as u32);
            }
            index = geom_end;
        }
    }
}

/// Writes the valid references of one chunk compactly to the front of `out`.
fn fill_chunk(
    scene: &dyn GeometryProvider,
    space: &PrimIndexSpace,
    range: std::ops::Range<usize>,
    out: &mut [PrimRef],
    begin: usize,
) -> PrimInfo {
    let mut info = PrimInfo::empty(begin);
    space.for_each_in(range, |geom_id, prim_id| {
        let bounds = scene
            .geometry(geom_id)
            .and_then(|geometry| geometry.prim_bounds(prim_id));
        if let Some(bounds) = bounds {
            let prim = PrimRef::new(bounds, geom_id, prim_id);
            out[info.size()] = prim;
            info.add(&prim);
        }
    });
    info
}

/// Creates one reference per valid primitive of `scene`.
///
/// On return `prims` holds exactly `info.size()` references with no gaps, and `info` bounds them
/// exactly. A scene without valid primitives yields an empty array and an empty info.
pub fn create_prim_ref_array(scene: &dyn GeometryProvider) -> (Vec<PrimRef>, PrimInfo) {
    let space = PrimIndexSpace::new(scene);
    let capacity = space.total();
    let mut prims = vec![PrimRef::default(); capacity];

    // First pass: every chunk writes provisionally at its own start.
    let chunk_infos: Vec<PrimInfo> = prims
        .par_chunks_mut(PRIM_REF_CHUNK)
        .enumerate()
        .map(|(chunk, out)| {
            let start = chunk * PRIM_REF_CHUNK;
            fill_chunk(scene, &space, start..start + out.len(), out, start)
        })
        .collect();
    let count: usize = chunk_infos.iter().map(PrimInfo::size).sum();

    let info = if count == capacity {
        chunk_infos
            .iter()
            .fold(PrimInfo::empty(0), |acc, chunk| acc.merge(chunk))
    } else {
        // Second pass: some primitives were filtered, rescan each chunk into its prefix offset.
        log::debug!(
            "prim refs: {} of {} primitives valid, compacting",
            count,
            capacity
        );
        let mut compacted = vec![PrimRef::default(); count];
        let mut outputs = Vec::with_capacity(chunk_infos.len());
        let mut rest: &mut [PrimRef] = &mut compacted;
        let mut offset = 0;
        for (chunk, chunk_info) in chunk_infos.iter().enumerate() {
            let (out, tail) = std::mem::take(&mut rest).split_at_mut(chunk_info.size());
            rest = tail;
            outputs.push((chunk, offset, out));
            offset += chunk_info.size();
        }
        let info = outputs
            .into_par_iter()
            .map(|(chunk, offset, out)| {
                let start = chunk * PRIM_REF_CHUNK;
                let end = (start + PRIM_REF_CHUNK).min(capacity);
                fill_chunk(scene, &space, start..end, out, offset)
            })
            .reduce(|| PrimInfo::empty(0), |a, b| a.merge(&b));
        prims = compacted;
        info
    };
    debug_assert_eq!(info.size(), prims.len(), "References must span the array exactly.");
    (prims, info)
}

/// Number of references [`create_prim_ref_array`] would produce, without storing them.
pub fn count_valid_prims(scene: &dyn GeometryProvider) -> usize {
    let space = PrimIndexSpace::new(scene);
    let total = space.total();
    (0..total.div_ceil(PRIM_REF_CHUNK))
        .into_par_iter()
        .map(|chunk| {
            let start = chunk * PRIM_REF_CHUNK;
            let mut count = 0;
            space.for_each_in(start..(start + PRIM_REF_CHUNK).min(total), |geom_id, prim_id| {
                let valid = scene
                    .geometry(geom_id)
                    .and_then(|geometry| geometry.prim_bounds(prim_id))
                    .is_some();
                count += valid as usize;
            });
            count
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Scene, TriangleMesh, UserGeometry};
    use crate::utilities::bounding_box::BoundingBox;
    use glam::Vec3;

    fn grid_mesh(count: usize, poison_every: usize) -> TriangleMesh {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for i in 0..count {
            let base = Vec3::new(i as f32, 0.0, 0.0);
            let first = vertices.len() as u32;
            let corner = if poison_every != 0 && i % poison_every == 0 {
                Vec3::splat(f32::NAN)
            } else {
                base + Vec3::Y
            };
            vertices.extend([base, base + Vec3::X, corner]);
            indices.push([first, first + 1, first + 2]);
        }
        TriangleMesh::new(vertices, indices)
    }

    #[test]
    fn test_all_valid_single_pass() {
        let mut scene = Scene::new();
        scene.add_triangle_mesh(grid_mesh(3000, 0));
        let (prims, info) = create_prim_ref_array(&scene);
        assert_eq!(prims.len(), 3000);
        assert_eq!(info.size(), 3000);
        assert_eq!(info.geom_bounds().min, Vec3::ZERO);
        assert_eq!(info.geom_bounds().max, Vec3::new(3000.0, 1.0, 0.0));
        assert!(prims.iter().enumerate().all(|(i, p)| p.prim_id == i as u32));
    }

    #[test]
    fn test_invalid_primitives_are_compacted() {
        let mut scene = Scene::new();
        scene.add_triangle_mesh(grid_mesh(2500, 7));
        scene.add_user_geometry(UserGeometry::new(
            10,
            |i| Some(BoundingBox::new(Vec3::splat(-(i as f32) - 1.0), Vec3::ZERO)),
            |_, _| None,
        ));
        let (prims, info) = create_prim_ref_array(&scene);
        let poisoned = (0..2500).filter(|i| i % 7 == 0).count();
        assert_eq!(prims.len(), 2500 - poisoned + 10);
        assert_eq!(info.size(), prims.len());
        assert_eq!(count_valid_prims(&scene), prims.len());
        assert_eq!(info, PrimInfo::from_prims(&prims, 0));
        assert!(prims.iter().all(|p| p.bounds().is_valid()));
        // Order follows the scene order.
        assert_eq!(prims.last().map(|p| (p.geom_id, p.prim_id)), Some((1, 9)));
    }

    #[test]
    fn test_empty_scene() {
        let scene = Scene::new();
        let (prims, info) = create_prim_ref_array(&scene);
        assert!(prims.is_empty());
        assert!(info.is_empty());
        assert!(info.geom_bounds().is_empty());
        assert_eq!(count_valid_prims(&scene), 0);
    }
}
