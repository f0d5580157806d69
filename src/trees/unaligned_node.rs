use super::node::NodeRef;
use super::prim_ref::PrimRef;
use super::ray_batcher::{safe_inverse, TreeRay};
use crate::utilities::bounding_box::BoundingBox;
use glam::{Mat3, Vec3};

/// Orthonormal frame whose third axis follows the dominant direction of a primitive set.
///
/// The direction joins the primitives with the extreme centroids along the longest centroid
/// axis. Rows of the returned matrix are the frame axes, so `space * p` gives frame coordinates.
pub fn compute_aligned_space(prims: &[PrimRef]) -> Mat3 {
    let mut cent_bounds = BoundingBox::EMPTY;
    for prim in prims {
        cent_bounds.extend(prim.center());
    }
    let axis = cent_bounds.largest_axis();
    let (mut first, mut last) = (None::<Vec3>, None::<Vec3>);
    for prim in prims {
        let c = prim.center();
        if first.map_or(true, |f| c[axis] < f[axis]) {
            first = Some(c);
        }
        if last.map_or(true, |l| c[axis] > l[axis]) {
            last = Some(c);
        }
    }
    let direction = match (first, last) {
        (Some(first), Some(last)) => (last - first).normalize_or(Vec3::Z),
        _ => Vec3::Z,
    };
    let (x, y) = direction.any_orthonormal_pair();
    Mat3::from_cols(x, y, direction).transpose()
}

/// Bounds of `prims` expressed in the frame `space`.
pub fn bounds_in_space(space: &Mat3, boxes: impl IntoIterator<Item = BoundingBox>) -> BoundingBox {
    let mut bounds = BoundingBox::EMPTY;
    for b in boxes {
        if b.is_empty() {
            continue;
        }
        for corner in b.corners() {
            bounds.extend(*space * corner);
        }
    }
    bounds
}

/// Inner node whose children are oriented boxes.
///
/// Child `i` stores the affine map `xfm * p + offset` taking world space into the unit cube of
/// its box, together with the orthonormal frame the box was measured in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnalignedNode<const N: usize> {
    pub children: [NodeRef; N],
    pub space: [Mat3; N],
    pub xfm: [Mat3; N],
    pub offset: [Vec3; N],
}

impl<const N: usize> Default for UnalignedNode<N> {
    fn default() -> Self {
        Self {
            children: [NodeRef::EMPTY; N],
            space: [Mat3::IDENTITY; N],
            xfm: [Mat3::ZERO; N],
            offset: [Vec3::ZERO; N],
        }
    }
}

impl<const N: usize> UnalignedNode<N> {
    /// Stores child `i` with its box `bounds` measured in frame `space`.
    pub fn set(&mut self, i: usize, child: NodeRef, space: Mat3, bounds: &BoundingBox) {
        self.children[i] = child;
        self.set_bounds(i, space, bounds);
    }

    pub fn set_bounds(&mut self, i: usize, space: Mat3, bounds: &BoundingBox) {
        // Grow by the rounding error of transforming points of this magnitude.
        let magnitude = bounds.min.abs().max(bounds.max.abs()).max_element();
        let pad = Vec3::splat(magnitude * 1.0e-5 + f32::MIN_POSITIVE);
        let min = bounds.min - pad;
        let inv_size = (bounds.max + pad - min).recip();
        self.space[i] = space;
        self.xfm[i] = Mat3::from_diagonal(inv_size) * space;
        self.offset[i] = -min * inv_size;
    }

    /// Re-measures child `i` from its world-space box, keeping its frame.
    pub fn refit_child(&mut self, i: usize, world_bounds: &BoundingBox) {
        let space = self.space[i];
        let bounds = bounds_in_space(&space, [*world_bounds]);
        self.set_bounds(i, space, &bounds);
    }

    /// Maps a world point into child `i`'s unit cube.
    #[inline(always)]
    pub fn to_unit(&self, i: usize, p: Vec3) -> Vec3 {
        self.xfm[i] * p + self.offset[i]
    }

    /// Whether the world-space box `b` lies inside child `i` up to `epsilon` in unit coordinates.
    pub fn child_encloses(&self, i: usize, b: &BoundingBox, epsilon: f32) -> bool {
        b.corners().iter().all(|&corner| {
            let u = self.to_unit(i, corner);
            u.cmpge(Vec3::splat(-epsilon)).all() && u.cmple(Vec3::splat(1.0 + epsilon)).all()
        })
    }

    /// World-space box enclosing the oriented box of child `i`.
    pub fn child_world_bounds(&self, i: usize) -> BoundingBox {
        if self.children[i].is_empty() {
            return BoundingBox::EMPTY;
        }
        let inverse = self.xfm[i].inverse();
        let unit = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
        BoundingBox::from_points(&unit.corners().map(|c| inverse * (c - self.offset[i])))
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    #[inline]
    pub fn intersect(&self, ray: &TreeRay, distances: &mut [f32; N]) -> u32 {
        let mut mask = 0;
        for i in 0..N {
            if self.children[i].is_empty() {
                break;
            }
            let origin = self.to_unit(i, ray.origin);
            let inverse_direction = safe_inverse(self.xfm[i] * ray.direction);
            let t0 = -origin * inverse_direction;
            let t1 = (Vec3::ONE - origin) * inverse_direction;
            let t_entry = ray.minimum_t.max(t0.min(t1).max_element());
            let t_exit = ray.maximum_t.min(t0.max(t1).min_element());
            if t_entry <= t_exit {
                distances[i] = t_entry;
                mask |= 1 << i;
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::Ray;
    use crate::utilities::memory::arena::Handle;

    fn diagonal_prims() -> Vec<PrimRef> {
        (0..10)
            .map(|i| {
                let c = Vec3::splat(i as f32);
                PrimRef::new(BoundingBox::new(c - 0.1, c + 0.1), 0, i)
            })
            .collect()
    }

    #[test]
    fn test_aligned_space_follows_diagonal() {
        let space = compute_aligned_space(&diagonal_prims());
        let axis = space.row(2);
        approx::assert_relative_eq!(axis.dot(Vec3::ONE.normalize()).abs(), 1.0, epsilon = 1e-5);
        // Orthonormal rows.
        approx::assert_relative_eq!(space.row(0).dot(space.row(1)), 0.0, epsilon = 1e-6);
        approx::assert_relative_eq!(space.row(0).length(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_child_encloses_its_primitives() {
        let prims = diagonal_prims();
        let space = compute_aligned_space(&prims);
        let bounds = bounds_in_space(&space, prims.iter().map(PrimRef::bounds));
        let mut node = UnalignedNode::<4>::default();
        node.set(0, NodeRef::leaf(Handle::new(0, 0), 3), space, &bounds);
        for prim in &prims {
            assert!(node.child_encloses(0, &prim.bounds(), 1e-4));
        }
        assert!(node.child_world_bounds(0).encloses(&BoundingBox::new(
            Vec3::splat(-0.05),
            Vec3::splat(9.05)
        )));
        assert_eq!(node.child_count(), 1);
    }

    #[test]
    fn test_ray_hits_oriented_box() {
        let prims = diagonal_prims();
        let space = compute_aligned_space(&prims);
        let bounds = bounds_in_space(&space, prims.iter().map(PrimRef::bounds));
        let mut node = UnalignedNode::<4>::default();
        node.set(0, NodeRef::leaf(Handle::new(0, 0), 10), space, &bounds);

        let mut distances = [0.0; 4];
        let along = TreeRay::new(&Ray::new(Vec3::new(5.0, 5.0, -10.0), Vec3::Z));
        assert_eq!(node.intersect(&along, &mut distances), 1);
        assert!(distances[0] > 9.0 && distances[0] < 15.0);

        // Passes through the world AABB corner region but far from the diagonal.
        let off = TreeRay::new(&Ray::new(Vec3::new(9.0, 0.0, -10.0), Vec3::Z));
        assert_eq!(node.intersect(&off, &mut distances), 0);
    }

    #[test]
    fn test_refit_child_keeps_frame() {
        let prims = diagonal_prims();
        let space = compute_aligned_space(&prims);
        let bounds = bounds_in_space(&space, prims.iter().map(PrimRef::bounds));
        let mut node = UnalignedNode::<4>::default();
        node.set(0, NodeRef::leaf(Handle::new(0, 0), 10), space, &bounds);
        let moved = BoundingBox::new(Vec3::splat(20.0), Vec3::splat(21.0));
        node.refit_child(0, &moved);
        assert_eq!(node.space[0], space);
        assert!(node.child_encloses(0, &moved, 1e-4));
    }
}
