use super::node::{intersects_ray, NodeKind, NodeRef};
use super::ray_batcher::TreeRay;
use super::tree::{Bvh, TRAVERSAL_STACK_CAPACITY};
use crate::primitives::Primitive;
use crate::ray::{Hit, Ray};
use crate::scene::GeometryProvider;
use crate::utilities::memory::arena::Handle;

/// LIFO stack with a fixed inline part that spills into a `Vec` only when full.
pub(crate) struct TraversalStack<T: Copy> {
    inline: [T; TRAVERSAL_STACK_CAPACITY],
    len: usize,
    overflow: Vec<T>,
}

impl<T: Copy> TraversalStack<T> {
    pub fn new(fill: T) -> Self {
        Self {
            inline: [fill; TRAVERSAL_STACK_CAPACITY],
            len: 0,
            overflow: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn push(&mut self, entry: T) {
        if self.len < TRAVERSAL_STACK_CAPACITY {
            self.inline[self.len] = entry;
            self.len += 1;
        } else {
            self.overflow.push(entry);
        }
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<T> {
        if let Some(entry) = self.overflow.pop() {
            return Some(entry);
        }
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.inline[self.len])
    }
}

/// Orders the hit children of an inner node nearest first. Ties keep child order.
/// Returns the number of valid entries written to `order`.
#[inline]
pub(crate) fn sort_hit_children<const N: usize>(
    mask: u32,
    distances: &[f32; N],
    order: &mut [(f32, usize); N],
) -> usize {
    let mut count = 0;
    for (i, &distance) in distances.iter().enumerate() {
        if mask & (1 << i) != 0 {
            order[count] = (distance, i);
            count += 1;
        }
    }
    order[..count].sort_by(|a, b| a.0.total_cmp(&b.0));
    count
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    /// Slab test of every child of an inner node, for any encoding.
    #[inline]
    pub(crate) fn intersect_children(&self, node: NodeRef, ray: &TreeRay, distances: &mut [f32; N]) -> u32 {
        match node.kind {
            NodeKind::Aligned(h) => self.aligned_nodes[h].intersect(ray, distances),
            NodeKind::Quantized(h) => self.quantized_nodes[h].intersect(ray, distances),
            NodeKind::Unaligned(h) => self.unaligned_nodes[h].intersect(ray, distances),
            _ => 0,
        }
    }

    /// Pushes the hit children of `node` so that the nearest is popped first.
    #[inline]
    fn push_hit_children(
        &self,
        node: NodeRef,
        mask: u32,
        distances: &[f32; N],
        stack: &mut TraversalStack<(NodeRef, f32)>,
    ) {
        let mut order = [(0.0f32, 0usize); N];
        let count = sort_hit_children(mask, distances, &mut order);
        let children = self.children(node);
        for &(distance, i) in order[..count].iter().rev() {
            stack.push((children[i], distance));
        }
    }

    #[inline]
    pub(crate) fn intersect_leaf(
        &self,
        block: Handle,
        count: u32,
        ray: &mut Ray,
        hit: &mut Hit,
        scene: &dyn GeometryProvider,
    ) -> bool {
        let mut found = false;
        for prim in self.leaf_blocks(block, count) {
            found |= prim.intersect(ray, hit, scene);
        }
        found
    }

    #[inline]
    pub(crate) fn occluded_leaf(&self, block: Handle, count: u32, ray: &Ray, scene: &dyn GeometryProvider) -> bool {
        self.leaf_blocks(block, count)
            .iter()
            .any(|prim| prim.occluded(ray, scene))
    }

    /// Nearest hit below `node`. Shrinks `ray.tfar` and writes `hit` when something closer than
    /// the current `ray.tfar` is found.
    pub(crate) fn intersect_subtree(
        &self,
        node: NodeRef,
        scene: &dyn GeometryProvider,
        ray: &mut Ray,
        hit: &mut Hit,
    ) -> bool {
        let mut tree_ray = TreeRay::new(ray);
        let mut stack = TraversalStack::new((NodeRef::EMPTY, 0.0f32));
        let mut distances = [0.0f32; N];
        let mut found = false;
        stack.push((node, ray.tnear));
        while let Some((node, distance)) = stack.pop() {
            if distance > ray.tfar {
                continue;
            }
            match node.kind {
                NodeKind::Leaf { block, count } => {
                    if self.intersect_leaf(block, count, ray, hit, scene) {
                        found = true;
                        tree_ray.maximum_t = ray.tfar;
                    }
                }
                NodeKind::Empty | NodeKind::Invalid => {}
                _ => {
                    let mask = self.intersect_children(node, &tree_ray, &mut distances);
                    self.push_hit_children(node, mask, &distances, &mut stack);
                }
            }
        }
        found
    }

    /// Whether anything below `node` blocks the ray segment.
    pub(crate) fn occluded_subtree(&self, node: NodeRef, scene: &dyn GeometryProvider, ray: &Ray) -> bool {
        let tree_ray = TreeRay::new(ray);
        let mut stack = TraversalStack::new(NodeRef::EMPTY);
        let mut distances = [0.0f32; N];
        stack.push(node);
        while let Some(node) = stack.pop() {
            match node.kind {
                NodeKind::Leaf { block, count } => {
                    if self.occluded_leaf(block, count, ray, scene) {
                        return true;
                    }
                }
                NodeKind::Empty | NodeKind::Invalid => {}
                _ => {
                    // Any order works for occlusion; child order keeps it cheap.
                    let mask = self.intersect_children(node, &tree_ray, &mut distances);
                    let children = self.children(node);
                    for i in (0..N).rev() {
                        if mask & (1 << i) != 0 {
                            stack.push(children[i]);
                        }
                    }
                }
            }
        }
        false
    }

    /// Whether the ray can touch the tree at all.
    #[inline]
    fn enters(&self, ray: &Ray) -> bool {
        ray.is_valid()
            && !self.is_empty()
            && intersects_ray(self.bounds.min, self.bounds.max, &TreeRay::new(ray)).is_some()
    }

    /// Finds the nearest hit along `ray` in `[tnear, tfar]`. On a hit, `ray.tfar` is set to the
    /// hit distance.
    pub fn intersect(&self, scene: &dyn GeometryProvider, ray: &mut Ray) -> Option<Hit> {
        if !self.enters(ray) {
            return None;
        }
        let mut hit = Hit::default();
        self.intersect_subtree(self.root, scene, ray, &mut hit)
            .then_some(hit)
    }

    /// Whether any primitive intersects `ray` in `[tnear, tfar]`.
    pub fn occluded(&self, scene: &dyn GeometryProvider, ray: &Ray) -> bool {
        self.enters(ray) && self.occluded_subtree(self.root, scene, ray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildSettings, BuilderKind, NodeEncoding};
    use crate::primitives::{ObjectPrim, Triangle4};
    use crate::scene::{Scene, TriangleMesh};
    use crate::test_support::{random_rays, random_scene, sphere_row};
    use glam::Vec3;

    /// Nearest hit by testing every triangle of every mesh.
    fn brute_force(scene: &Scene, ray: &Ray) -> Option<Hit> {
        let mut ray = *ray;
        let mut best = None;
        for geom_id in 0..scene.geometry_count() as u32 {
            let Some(geometry) = scene.geometry(geom_id) else { continue };
            for prim_id in 0..geometry.prim_count() as u32 {
                let Some([a, b, c]) = geometry.triangle(prim_id) else { continue };
                if let Some(mut hit) = crate::primitives::triangle::intersect_triangle(a, b - a, c - a, &ray) {
                    hit.geom_id = geom_id;
                    hit.prim_id = prim_id;
                    ray.tfar = hit.t;
                    best = Some(hit);
                }
            }
        }
        best
    }

    #[test]
    fn test_stack_spills_and_keeps_order() {
        let mut stack = TraversalStack::new(0usize);
        for i in 0..TRAVERSAL_STACK_CAPACITY + 10 {
            stack.push(i);
        }
        for i in (0..TRAVERSAL_STACK_CAPACITY + 10).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_hit_children_sorted_stably() {
        let mut order = [(0.0, 0); 4];
        let count = sort_hit_children(0b1011, &[3.0, 1.0, 9.0, 1.0], &mut order);
        assert_eq!(count, 3);
        assert_eq!(&order[..3], &[(1.0, 1), (1.0, 3), (3.0, 0)]);
    }

    #[test]
    fn test_known_triangle_hit() {
        let mut scene = Scene::new();
        scene.add_triangle_mesh(TriangleMesh::new(
            vec![Vec3::new(-1.0, -1.0, 5.0), Vec3::new(1.0, -1.0, 5.0), Vec3::new(-1.0, 1.0, 5.0)],
            vec![[0, 1, 2]],
        ));
        let bvh = Bvh::<Triangle4, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let mut ray = Ray::new(Vec3::new(-0.5, -0.5, 0.0), Vec3::Z);
        let hit = bvh.intersect(&scene, &mut ray).unwrap();
        approx::assert_relative_eq!(hit.t, 5.0);
        approx::assert_relative_eq!(hit.u, 0.25);
        approx::assert_relative_eq!(hit.v, 0.25);
        assert_eq!((hit.geom_id, hit.prim_id), (0, 0));
        assert_eq!(ray.tfar, hit.t);

        let mut miss = Ray::new(Vec3::new(2.0, 2.0, 0.0), Vec3::Z);
        assert!(bvh.intersect(&scene, &mut miss).is_none());
        assert_eq!(miss.tfar, f32::INFINITY);
    }

    #[test]
    fn test_matches_brute_force_for_every_configuration() {
        let scene = random_scene(600, 11);
        let rays = random_rays(200, 50.0, 5);
        for builder in [BuilderKind::Sah, BuilderKind::Morton] {
            for encoding in [NodeEncoding::Aligned, NodeEncoding::Quantized, NodeEncoding::Unaligned] {
                let settings = BuildSettings::default()
                    .with_builder(builder)
                    .with_encoding(encoding);
                let bvh = Bvh::<Triangle4, 8>::build(&scene, &settings).unwrap();
                for ray in &rays {
                    let expected = brute_force(&scene, ray);
                    let mut traced = *ray;
                    let hit = bvh.intersect(&scene, &mut traced);
                    assert_eq!(hit.map(|h| h.prim_id), expected.map(|h| h.prim_id), "{builder} {encoding}");
                    if let (Some(hit), Some(expected)) = (hit, expected) {
                        approx::assert_relative_eq!(hit.t, expected.t, max_relative = 1e-5);
                    }
                    assert_eq!(bvh.occluded(&scene, ray), expected.is_some());
                }
            }
        }
    }

    #[test]
    fn test_occlusion_respects_segment() {
        let mut scene = Scene::new();
        scene.add_user_geometry(sphere_row(8));
        let bvh = Bvh::<ObjectPrim, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let toward = Ray::new(Vec3::new(6.0, 0.0, -5.0), Vec3::Z);
        assert!(bvh.occluded(&scene, &toward));
        assert!(!bvh.occluded(&scene, &toward.with_segment(0.0, 3.0)));
        let mut nearest = toward;
        let hit = bvh.intersect(&scene, &mut nearest).unwrap();
        assert_eq!(hit.prim_id, 3);
        approx::assert_relative_eq!(hit.t, 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_tree_hits_nothing() {
        let scene = Scene::new();
        let bvh = Bvh::<Triangle4, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let mut ray = Ray::new(Vec3::ZERO, Vec3::X);
        assert!(bvh.intersect(&scene, &mut ray).is_none());
        assert!(!bvh.occluded(&scene, &ray));
    }

    #[test]
    fn test_masked_geometry_is_skipped() {
        let mut scene = Scene::new();
        scene.add_triangle_mesh(
            TriangleMesh::new(
                vec![Vec3::new(-1.0, -1.0, 2.0), Vec3::new(1.0, -1.0, 2.0), Vec3::new(0.0, 1.0, 2.0)],
                vec![[0, 1, 2]],
            )
            .with_mask(0b10),
        );
        let bvh = Bvh::<Triangle4, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let ray = Ray::new(Vec3::ZERO, Vec3::Z);
        assert!(!bvh.occluded(&scene, &ray.with_mask(0b01)));
        assert!(bvh.occluded(&scene, &ray.with_mask(0b10)));
    }
}
