//! Minimal geometry storage feeding the builders.
//!
//! The builders only see the [`GeometryProvider`] contract; [`Scene`] is the in-memory
//! implementation shipped with the crate, holding triangle meshes and user geometries.

use crate::primitives::triangle::{intersect_triangle, split_triangle};
use crate::ray::{Hit, Ray};
use crate::trees::user_builder::split_box;
use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;

/// A set of primitives sharing one geometry id.
pub trait Geometry: Send + Sync {
    fn prim_count(&self) -> usize;

    /// Tight bounds of primitive `prim_id`, or `None` when the primitive is degenerate and must
    /// not enter the hierarchy (non-finite vertices, out of range indices, empty boxes).
    fn prim_bounds(&self, prim_id: u32) -> Option<BoundingBox>;

    /// Rays only test this geometry when `ray.mask & mask != 0`.
    fn mask(&self) -> u32 {
        u32::MAX
    }

    /// The three vertices of a triangle primitive. Non-triangle geometries return `None`.
    fn triangle(&self, _prim_id: u32) -> Option<[Vec3; 3]> {
        None
    }

    /// Intersects primitive `prim_id` within `[ray.tnear, ray.tfar]`.
    /// The returned hit's ids are filled in by the caller.
    fn intersect(&self, prim_id: u32, ray: &Ray) -> Option<Hit>;

    /// Bounds of the parts of primitive `prim_id` below and above `position` on `axis`, both
    /// within `bounds`, the box of the piece being split. Triangles are clipped exactly, other
    /// primitives cut `bounds` in two.
    fn split_bounds(
        &self,
        prim_id: u32,
        bounds: &BoundingBox,
        axis: usize,
        position: f32,
    ) -> (BoundingBox, BoundingBox) {
        match self.triangle(prim_id) {
            Some(vertices) => split_triangle(&vertices, bounds, axis, position),
            None => split_box(bounds, axis, position),
        }
    }

    fn occluded(&self, prim_id: u32, ray: &Ray) -> bool {
        self.intersect(prim_id, ray).is_some()
    }
}

/// Read access to all geometries of a scene, indexed by geometry id.
pub trait GeometryProvider: Sync {
    fn geometry_count(&self) -> usize;

    fn geometry(&self, geom_id: u32) -> Option<&dyn Geometry>;

    /// Upper bound of the number of primitive references a build produces.
    fn size(&self) -> usize {
        (0..self.geometry_count() as u32)
            .filter_map(|geom_id| self.geometry(geom_id))
            .map(|geometry| geometry.prim_count())
            .sum()
    }
}

/// Indexed triangle mesh.
#[derive(Clone, Debug, Default)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<[u32; 3]>,
    pub mask: u32,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            indices,
            mask: u32::MAX,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Moves every vertex by `offset`.
    pub fn translate(&mut self, offset: Vec3) {
        for vertex in &mut self.vertices {
            *vertex += offset;
        }
    }
}

impl Geometry for TriangleMesh {
    fn prim_count(&self) -> usize {
        self.indices.len()
    }

    fn prim_bounds(&self, prim_id: u32) -> Option<BoundingBox> {
        let vertices = self.triangle(prim_id)?;
        if !vertices.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(BoundingBox::from_points(&vertices))
    }

    fn mask(&self) -> u32 {
        self.mask
    }

    fn triangle(&self, prim_id: u32) -> Option<[Vec3; 3]> {
        let [a, b, c] = *self.indices.get(prim_id as usize)?;
        Some([
            *self.vertices.get(a as usize)?,
            *self.vertices.get(b as usize)?,
            *self.vertices.get(c as usize)?,
        ])
    }

    fn intersect(&self, prim_id: u32, ray: &Ray) -> Option<Hit> {
        let [v0, v1, v2] = self.triangle(prim_id)?;
        intersect_triangle(v0, v1 - v0, v2 - v0, ray)
    }
}

type BoundsFn = dyn Fn(u32) -> Option<BoundingBox> + Send + Sync;
type IntersectFn = dyn Fn(u32, &Ray) -> Option<Hit> + Send + Sync;
type OccludedFn = dyn Fn(u32, &Ray) -> bool + Send + Sync;

/// Geometry whose bounds and intersection are user callbacks (spheres, instances, ...).
pub struct UserGeometry {
    prim_count: usize,
    mask: u32,
    bounds: Box<BoundsFn>,
    intersect: Box<IntersectFn>,
    occluded: Option<Box<OccludedFn>>,
}

impl std::fmt::Debug for UserGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserGeometry")
            .field("prim_count", &self.prim_count)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

impl UserGeometry {
    pub fn new<B, I>(prim_count: usize, bounds: B, intersect: I) -> Self
    where
        B: Fn(u32) -> Option<BoundingBox> + Send + Sync + 'static,
        I: Fn(u32, &Ray) -> Option<Hit> + Send + Sync + 'static,
    {
        Self {
            prim_count,
            mask: u32::MAX,
            bounds: Box::new(bounds),
            intersect: Box::new(intersect),
            occluded: None,
        }
    }

    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    /// Dedicated occlusion callback. Without one, occlusion falls back to `intersect`.
    pub fn with_occluded<O>(mut self, occluded: O) -> Self
    where
        O: Fn(u32, &Ray) -> bool + Send + Sync + 'static,
    {
        self.occluded = Some(Box::new(occluded));
        self
    }
}

impl Geometry for UserGeometry {
    fn prim_count(&self) -> usize {
        self.prim_count
    }

    fn prim_bounds(&self, prim_id: u32) -> Option<BoundingBox> {
        (self.bounds)(prim_id).filter(BoundingBox::is_valid)
    }

    fn mask(&self) -> u32 {
        self.mask
    }

    fn intersect(&self, prim_id: u32, ray: &Ray) -> Option<Hit> {
        (self.intersect)(prim_id, ray)
    }

    fn occluded(&self, prim_id: u32, ray: &Ray) -> bool {
        match &self.occluded {
            Some(occluded) => occluded(prim_id, ray),
            None => (self.intersect)(prim_id, ray).is_some(),
        }
    }
}

#[derive(Debug)]
enum SceneGeometry {
    Triangles(TriangleMesh),
    User(UserGeometry),
}

/// In-memory scene. Geometry ids are assigned in insertion order.
#[derive(Debug, Default)]
pub struct Scene {
    geometries: Vec<SceneGeometry>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_triangle_mesh(&mut self, mesh: TriangleMesh) -> u32 {
        self.geometries.push(SceneGeometry::Triangles(mesh));
        self.geometries.len() as u32 - 1
    }

    pub fn add_user_geometry(&mut self, geometry: UserGeometry) -> u32 {
        self.geometries.push(SceneGeometry::User(geometry));
        self.geometries.len() as u32 - 1
    }

    pub fn mesh(&self, geom_id: u32) -> Option<&TriangleMesh> {
        match self.geometries.get(geom_id as usize)? {
            SceneGeometry::Triangles(mesh) => Some(mesh),
            SceneGeometry::User(_) => None,
        }
    }

    /// Mutable access to a mesh. The acceleration structure must be updated afterwards.
    pub fn mesh_mut(&mut self, geom_id: u32) -> Option<&mut TriangleMesh> {
        match self.geometries.get_mut(geom_id as usize)? {
            SceneGeometry::Triangles(mesh) => Some(mesh),
            SceneGeometry::User(_) => None,
        }
    }
}

impl GeometryProvider for Scene {
    fn geometry_count(&self) -> usize {
        self.geometries.len()
    }

    fn geometry(&self, geom_id: u32) -> Option<&dyn Geometry> {
        match self.geometries.get(geom_id as usize)? {
            SceneGeometry::Triangles(mesh) => Some(mesh),
            SceneGeometry::User(user) => Some(user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_triangles_have_no_bounds() {
        let mesh = TriangleMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::splat(f32::NAN)],
            vec![[0, 1, 2], [0, 1, 3], [0, 1, 9], [0, 0, 0]],
        );
        assert!(mesh.prim_bounds(0).is_some());
        assert!(mesh.prim_bounds(1).is_none());
        assert!(mesh.prim_bounds(2).is_none());
        // Zero area, still finite.
        assert!(mesh.prim_bounds(3).is_some());
    }

    #[test]
    fn test_scene_ids_and_size() {
        let mut scene = Scene::new();
        let mesh = TriangleMesh::new(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![[0, 1, 2]; 3]);
        assert_eq!(scene.add_triangle_mesh(mesh), 0);
        let user = UserGeometry::new(5, |_| None, |_, _| None);
        assert_eq!(scene.add_user_geometry(user), 1);
        assert_eq!(scene.size(), 8);
        assert!(scene.mesh(0).is_some());
        assert!(scene.mesh(1).is_none());
        assert!(scene.geometry(2).is_none());
    }

    #[test]
    fn test_occlusion_callback_overrides_intersect() {
        let bounds = |_| Some(BoundingBox::new(Vec3::ZERO, Vec3::ONE));
        let ray = Ray::new(Vec3::new(0.5, 0.5, -1.0), Vec3::Z);
        let plain = UserGeometry::new(1, bounds, |_, _| None);
        assert!(!plain.occluded(0, &ray));
        let blocking = UserGeometry::new(1, bounds, |_, _| None).with_occluded(|_, _| true);
        assert!(blocking.occluded(0, &ray));
    }
}
