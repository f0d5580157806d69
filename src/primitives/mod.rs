//! Primitive types stored in tree leaves.

pub mod object;
pub mod triangle;

pub use object::ObjectPrim;
pub use triangle::Triangle4;

use crate::ray::{Hit, Ray};
use crate::scene::GeometryProvider;
use crate::trees::prim_ref::PrimRef;
use crate::utilities::bounding_box::BoundingBox;

/// Capabilities the builders and traversers need from a leaf primitive type.
///
/// A leaf is a contiguous run of primitive blocks. Each block packs up to [`Primitive::max_size`]
/// primitive references.
pub trait Primitive: Clone + Default + Send + Sync + 'static {
    /// Name used in log output.
    const NAME: &'static str;

    /// When set, leaves point directly into the primitive reference array, which the build hands
    /// over to the leaf arena after all leaves exist; [`Primitive::fill`] is never called.
    const ALIASES_PRIM_REFS: bool = false;

    /// Maximum number of primitive references one block holds.
    fn max_size() -> usize;

    /// Number of blocks needed to store `count` references.
    #[inline(always)]
    fn blocks(count: usize) -> usize {
        count.div_ceil(Self::max_size())
    }

    /// Packs at most [`Primitive::max_size`] references into one block.
    fn fill(prims: &[PrimRef], scene: &dyn GeometryProvider) -> Self;

    /// Converts the finished reference array into leaf storage for aliasing primitive types.
    fn alias(prims: Vec<PrimRef>) -> Vec<Self> {
        debug_assert!(
            !Self::ALIASES_PRIM_REFS,
            "Aliasing primitive types must provide their own conversion."
        );
        drop(prims);
        Vec::new()
    }

    /// Number of primitives in the block.
    fn size(&self) -> usize;

    /// Geometry and primitive id of the primitive in `slot`.
    fn id(&self, slot: usize) -> (u32, u32);

    /// Current bounds of the block, read from the scene.
    fn bounds(&self, scene: &dyn GeometryProvider) -> BoundingBox;

    /// Re-reads any cached geometry from the scene and returns the new bounds.
    fn update(&mut self, scene: &dyn GeometryProvider) -> BoundingBox;

    /// Finds the nearest intersection in `[ray.tnear, ray.tfar]`. On success writes `hit`,
    /// shrinks `ray.tfar` to the hit distance and returns `true`.
    fn intersect(&self, ray: &mut Ray, hit: &mut Hit, scene: &dyn GeometryProvider) -> bool;

    /// Whether any primitive in the block intersects the ray segment.
    fn occluded(&self, ray: &Ray, scene: &dyn GeometryProvider) -> bool;
}
