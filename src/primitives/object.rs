use super::Primitive;
use crate::ray::{Hit, Ray};
use crate::scene::GeometryProvider;
use crate::trees::prim_ref::PrimRef;
use crate::utilities::bounding_box::BoundingBox;

/// A user geometry primitive. Intersection is delegated to the geometry's callback.
///
/// Leaves of this type alias the primitive reference array: the build donates the array to the
/// leaf arena, so a leaf is just a range of references.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ObjectPrim(pub PrimRef);

impl Primitive for ObjectPrim {
    const NAME: &'static str = "object";
    const ALIASES_PRIM_REFS: bool = true;

    #[inline(always)]
    fn max_size() -> usize {
        1
    }

    fn fill(prims: &[PrimRef], _scene: &dyn GeometryProvider) -> Self {
        debug_assert_eq!(prims.len(), 1, "An object block holds exactly one reference.");
        Self(prims.first().copied().unwrap_or_default())
    }

    fn alias(prims: Vec<PrimRef>) -> Vec<Self> {
        prims.into_iter().map(ObjectPrim).collect()
    }

    #[inline(always)]
    fn size(&self) -> usize {
        1
    }

    #[inline(always)]
    fn id(&self, _slot: usize) -> (u32, u32) {
        (self.0.geom_id, self.0.prim_id)
    }

    fn bounds(&self, scene: &dyn GeometryProvider) -> BoundingBox {
        scene
            .geometry(self.0.geom_id)
            .and_then(|geometry| geometry.prim_bounds(self.0.prim_id))
            .unwrap_or_else(|| self.0.bounds())
    }

    fn update(&mut self, scene: &dyn GeometryProvider) -> BoundingBox {
        let bounds = self.bounds(scene);
        self.0.lower = bounds.min;
        self.0.upper = bounds.max;
        bounds
    }

    fn intersect(&self, ray: &mut Ray, hit: &mut Hit, scene: &dyn GeometryProvider) -> bool {
        let Some(geometry) = scene.geometry(self.0.geom_id) else {
            return false;
        };
        if geometry.mask() & ray.mask == 0 {
            return false;
        }
        match geometry.intersect(self.0.prim_id, ray) {
            Some(mut candidate) if candidate.t >= ray.tnear && candidate.t <= ray.tfar => {
                candidate.geom_id = self.0.geom_id;
                candidate.prim_id = self.0.prim_id;
                ray.tfar = candidate.t;
                *hit = candidate;
                true
            }
            _ => false,
        }
    }

    fn occluded(&self, ray: &Ray, scene: &dyn GeometryProvider) -> bool {
        scene.geometry(self.0.geom_id).is_some_and(|geometry| {
            geometry.mask() & ray.mask != 0 && geometry.occluded(self.0.prim_id, ray)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;
    use crate::test_support::sphere_row;
    use glam::Vec3;

    #[test]
    fn test_user_callback_fills_ids() {
        let mut scene = Scene::new();
        scene.add_user_geometry(sphere_row(3));
        let prim = ObjectPrim(PrimRef::new(
            BoundingBox::new(Vec3::new(3.0, -1.0, -1.0), Vec3::new(5.0, 1.0, 1.0)),
            0,
            2,
        ));
        let mut ray = Ray::new(Vec3::new(4.0, 0.0, 10.0), -Vec3::Z);
        let mut hit = Hit::default();
        assert!(prim.intersect(&mut ray, &mut hit, &scene));
        assert_eq!((hit.geom_id, hit.prim_id), (0, 2));
        assert_eq!(ray.tfar, 9.0);
        assert!(prim.occluded(&Ray::new(Vec3::new(4.0, 0.0, 10.0), -Vec3::Z), &scene));
        assert!(!prim.occluded(&Ray::new(Vec3::new(0.0, 0.0, 10.0), -Vec3::Z), &scene));
    }

    #[test]
    fn test_alias_keeps_order() {
        let refs: Vec<PrimRef> = (0..4)
            .map(|i| PrimRef::new(BoundingBox::from_point(Vec3::ZERO), 0, i))
            .collect();
        let aliased = ObjectPrim::alias(refs.clone());
        assert_eq!(aliased.iter().map(|p| p.0).collect::<Vec<_>>(), refs);
    }
}
