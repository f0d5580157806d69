use super::Primitive;
use crate::ray::{Hit, Ray, INVALID_ID};
use crate::scene::GeometryProvider;
use crate::trees::prim_ref::PrimRef;
use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;

/// Bounds of the parts of the triangle below and above `position` on `axis`, each clipped to
/// `bounds`. A side the triangle does not reach comes back empty.
pub fn split_triangle(
    vertices: &[Vec3; 3],
    bounds: &BoundingBox,
    axis: usize,
    position: f32,
) -> (BoundingBox, BoundingBox) {
    let mut left = BoundingBox::EMPTY;
    let mut right = BoundingBox::EMPTY;
    for i in 0..3 {
        let (v0, v1) = (vertices[i], vertices[(i + 1) % 3]);
        let (d0, d1) = (v0[axis] - position, v1[axis] - position);
        if d0 <= 0.0 {
            left.extend(v0);
        }
        if d0 >= 0.0 {
            right.extend(v0);
        }
        if (d0 < 0.0 && d1 > 0.0) || (d0 > 0.0 && d1 < 0.0) {
            let mut cut = v0 + (v1 - v0) * (d0 / (d0 - d1));
            cut[axis] = position;
            left.extend(cut);
            right.extend(cut);
        }
    }
    (left.intersection(bounds), right.intersection(bounds))
}

/// Möller-Trumbore test of a two-sided triangle given as `v0` and its edges `e1 = v1 - v0`,
/// `e2 = v2 - v0`. Ids of the returned hit are left invalid.
#[inline]
pub fn intersect_triangle(v0: Vec3, e1: Vec3, e2: Vec3, ray: &Ray) -> Option<Hit> {
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det == 0.0 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - v0;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t < ray.tnear || t > ray.tfar {
        return None;
    }
    Some(Hit {
        t,
        u,
        v,
        ng: e1.cross(e2),
        geom_id: INVALID_ID,
        prim_id: INVALID_ID,
    })
}

/// Up to four triangles with their vertices cached in SoA layout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Triangle4 {
    pub v0: [Vec3; 4],
    pub e1: [Vec3; 4],
    pub e2: [Vec3; 4],
    pub geom_ids: [u32; 4],
    pub prim_ids: [u32; 4],
    pub masks: [u32; 4],
    pub count: u32,
}

impl Triangle4 {
    fn vertices(scene: &dyn GeometryProvider, geom_id: u32, prim_id: u32) -> Option<[Vec3; 3]> {
        scene.geometry(geom_id)?.triangle(prim_id)
    }

    fn set(&mut self, slot: usize, [a, b, c]: [Vec3; 3]) {
        self.v0[slot] = a;
        self.e1[slot] = b - a;
        self.e2[slot] = c - a;
    }
}

impl Primitive for Triangle4 {
    const NAME: &'static str = "triangle4";

    #[inline(always)]
    fn max_size() -> usize {
        4
    }

    fn fill(prims: &[PrimRef], scene: &dyn GeometryProvider) -> Self {
        debug_assert!(
            !prims.is_empty() && prims.len() <= Self::max_size(),
            "A block holds between one and four triangles."
        );
        let mut block = Self::default();
        for (slot, prim) in prims.iter().enumerate() {
            block.geom_ids[slot] = prim.geom_id;
            block.prim_ids[slot] = prim.prim_id;
            block.masks[slot] = scene.geometry(prim.geom_id).map_or(0, |g| g.mask());
            // Falls back to the degenerate point at the box corner if the geometry vanished.
            let vertices = Self::vertices(scene, prim.geom_id, prim.prim_id)
                .unwrap_or([prim.lower; 3]);
            block.set(slot, vertices);
        }
        block.count = prims.len() as u32;
        block
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.count as usize
    }

    #[inline(always)]
    fn id(&self, slot: usize) -> (u32, u32) {
        (self.geom_ids[slot], self.prim_ids[slot])
    }

    fn bounds(&self, _scene: &dyn GeometryProvider) -> BoundingBox {
        let mut bounds = BoundingBox::EMPTY;
        for i in 0..self.size() {
            bounds.extend(self.v0[i]);
            bounds.extend(self.v0[i] + self.e1[i]);
            bounds.extend(self.v0[i] + self.e2[i]);
        }
        bounds
    }

    fn update(&mut self, scene: &dyn GeometryProvider) -> BoundingBox {
        for i in 0..self.size() {
            if let Some(vertices) = Self::vertices(scene, self.geom_ids[i], self.prim_ids[i]) {
                self.set(i, vertices);
            }
        }
        self.bounds(scene)
    }

    fn intersect(&self, ray: &mut Ray, hit: &mut Hit, _scene: &dyn GeometryProvider) -> bool {
        let mut found = false;
        for i in 0..self.size() {
            if self.masks[i] & ray.mask == 0 {
                continue;
            }
            if let Some(mut candidate) = intersect_triangle(self.v0[i], self.e1[i], self.e2[i], ray) {
                candidate.geom_id = self.geom_ids[i];
                candidate.prim_id = self.prim_ids[i];
                ray.tfar = candidate.t;
                *hit = candidate;
                found = true;
            }
        }
        found
    }

    fn occluded(&self, ray: &Ray, _scene: &dyn GeometryProvider) -> bool {
        (0..self.size()).any(|i| {
            self.masks[i] & ray.mask != 0
                && intersect_triangle(self.v0[i], self.e1[i], self.e2[i], ray).is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Scene, TriangleMesh};
    use approx::assert_relative_eq;

    fn unit_triangle() -> [Vec3; 3] {
        [Vec3::ZERO, Vec3::X, Vec3::Y]
    }

    #[test]
    fn test_moller_trumbore() {
        let [a, b, c] = unit_triangle();
        let ray = Ray::new(Vec3::new(0.25, 0.25, 1.0), -Vec3::Z);
        let hit = intersect_triangle(a, b - a, c - a, &ray).unwrap();
        assert_relative_eq!(hit.t, 1.0);
        assert_relative_eq!(hit.u, 0.25);
        assert_relative_eq!(hit.v, 0.25);
        assert_eq!(hit.ng, Vec3::Z);

        let miss = Ray::new(Vec3::new(0.75, 0.75, 1.0), -Vec3::Z);
        assert!(intersect_triangle(a, b - a, c - a, &miss).is_none());
        let short = ray.with_segment(0.0, 0.5);
        assert!(intersect_triangle(a, b - a, c - a, &short).is_none());
    }

    #[test]
    fn test_split_triangle_clips_to_each_side() {
        let vertices = [Vec3::ZERO, Vec3::new(4.0, 0.0, 0.0), Vec3::new(0.0, 4.0, 0.0)];
        let bounds = BoundingBox::from_points(&vertices);
        let (left, right) = split_triangle(&vertices, &bounds, 0, 1.0);
        assert_eq!(left, BoundingBox::new(Vec3::ZERO, Vec3::new(1.0, 4.0, 0.0)));
        assert_eq!(right, BoundingBox::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(4.0, 3.0, 0.0)));

        // A piece of an earlier split stays inside that piece.
        let (inner, _) = split_triangle(&vertices, &right, 0, 2.5);
        assert!(right.encloses(&inner));
        assert_eq!(inner.min.x, 1.0);

        let (all, none) = split_triangle(&vertices, &bounds, 0, 5.0);
        assert_eq!(all, bounds);
        assert!(none.is_empty());
    }

    #[test]
    fn test_block_keeps_nearest_and_respects_masks() {
        let mut scene = Scene::new();
        let near = TriangleMesh::new(
            vec![Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 1.0), Vec3::new(0.0, 1.0, 1.0)],
            vec![[0, 1, 2]],
        )
        .with_mask(0b10);
        let far = TriangleMesh::new(unit_triangle().to_vec(), vec![[0, 1, 2]]).with_mask(0b01);
        scene.add_triangle_mesh(near);
        scene.add_triangle_mesh(far);
        let prims = [
            PrimRef::new(BoundingBox::from_points(&unit_triangle()), 1, 0),
            PrimRef::new(BoundingBox::from_points(&unit_triangle()), 0, 0),
        ];
        let block = Triangle4::fill(&prims, &scene);
        assert_eq!(block.size(), 2);

        let mut ray = Ray::new(Vec3::new(0.2, 0.2, 5.0), -Vec3::Z);
        let mut hit = Hit::default();
        assert!(block.intersect(&mut ray, &mut hit, &scene));
        assert_eq!((hit.geom_id, hit.prim_id), (0, 0));
        assert_relative_eq!(ray.tfar, 4.0);

        let mut masked = Ray::new(Vec3::new(0.2, 0.2, 5.0), -Vec3::Z).with_mask(0b01);
        let mut hit = Hit::default();
        assert!(block.intersect(&mut masked, &mut hit, &scene));
        assert_eq!(hit.geom_id, 1);
        assert!(!block.occluded(&Ray::new(Vec3::new(0.2, 0.2, 5.0), -Vec3::Z).with_mask(0b100), &scene));
    }

    #[test]
    fn test_update_rereads_vertices() {
        let mut scene = Scene::new();
        scene.add_triangle_mesh(TriangleMesh::new(unit_triangle().to_vec(), vec![[0, 1, 2]]));
        let prims = [PrimRef::new(BoundingBox::from_points(&unit_triangle()), 0, 0)];
        let mut block = Triangle4::fill(&prims, &scene);
        scene.mesh_mut(0).unwrap().translate(Vec3::Z * 2.0);
        let bounds = block.update(&scene);
        assert_eq!(bounds.min, Vec3::new(0.0, 0.0, 2.0));
        assert_eq!(bounds.max, Vec3::new(1.0, 1.0, 2.0));
    }
}
