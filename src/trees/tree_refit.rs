use super::node::{NodeKind, NodeRef};
use super::tree::Bvh;
use crate::primitives::Primitive;
use crate::scene::GeometryProvider;
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::memory::arena::Handle;
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;

/// New contents of one subtree, computed without touching the tree.
struct RefitUpdates<P, const N: usize> {
    nodes: Vec<(NodeRef, [BoundingBox; N])>,
    leaves: Vec<(Handle, P)>,
}

impl<P, const N: usize> Default for RefitUpdates<P, N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            leaves: Vec::new(),
        }
    }
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    /// Recomputes every box of the tree from the current scene, keeping the topology.
    ///
    /// Valid only when the scene still holds the same primitives as at build time; only their
    /// positions may have changed. Large trees refit independent subtrees in parallel.
    pub fn refit(&mut self, scene: &dyn GeometryProvider) {
        if self.is_empty() {
            return;
        }
        let start = Instant::now();
        let parallel = self.prim_count >= self.settings.refit_parallel_threshold && self.root.is_inner();
        let bounds = if parallel {
            let dispatcher = self.dispatcher.clone();
            dispatcher.install(|| self.refit_parallel(scene))
        } else {
            let mut updates = RefitUpdates::default();
            let bounds = self.collect_refit(self.root, scene, &HashMap::new(), &mut updates);
            self.apply_refit(updates);
            bounds
        };
        self.bounds = bounds;
        log::debug!(
            "refit of {} primitives ({}) in {:.2?}",
            self.prim_count,
            if parallel { "parallel" } else { "serial" },
            start.elapsed()
        );
    }

    fn refit_parallel(&mut self, scene: &dyn GeometryProvider) -> BoundingBox {
        let frontier = self.mark_frontier(self.settings.refit_frontier_depth);
        log::trace!("refit: {} subtrees below the frontier", frontier.len());

        let this = &*self;
        let subtrees: Vec<(NodeKind, BoundingBox, RefitUpdates<P, N>)> = frontier
            .par_iter()
            .map(|&node| {
                let mut updates = RefitUpdates::default();
                let bounds = this.collect_refit(node, scene, &HashMap::new(), &mut updates);
                (node.kind, bounds, updates)
            })
            .collect();

        let mut frontier_bounds = HashMap::with_capacity(subtrees.len());
        for (kind, bounds, updates) in subtrees {
            frontier_bounds.insert(kind, bounds);
            self.apply_refit(updates);
        }

        // Top pass over the nodes above the barriers.
        let mut updates = RefitUpdates::default();
        let bounds = self.collect_refit(self.root, scene, &frontier_bounds, &mut updates);
        self.apply_refit(updates);
        self.clear_barriers(self.root);
        bounds
    }

    /// Marks the children found `depth` levels below the root (or leaves found earlier) as
    /// barriers and returns them.
    fn mark_frontier(&mut self, depth: usize) -> Vec<NodeRef> {
        let mut frontier = Vec::new();
        let mut level = vec![self.root];
        for _ in 0..depth.max(1) {
            let mut next = Vec::new();
            for node in level {
                for i in 0..self.children(node).len() {
                    let child = self.children(node)[i];
                    if child.is_empty() {
                        continue;
                    }
                    if child.is_leaf() {
                        frontier.push(child);
                        self.set_child_barrier(node, i, true);
                    } else {
                        next.push((node, i, child));
                    }
                }
            }
            level = next.iter().map(|&(_, _, child)| child).collect();
            if level.is_empty() {
                return frontier;
            }
            if frontier.len() + level.len() >= rayon::current_num_threads() * 4 {
                // Enough tasks; stop here.
                for (parent, i, child) in next {
                    frontier.push(child);
                    self.set_child_barrier(parent, i, true);
                }
                return frontier;
            }
        }
        for node in level {
            for i in 0..self.children(node).len() {
                let child = self.children(node)[i];
                if !child.is_empty() {
                    frontier.push(child);
                    self.set_child_barrier(node, i, true);
                }
            }
        }
        frontier
    }

    fn set_child_barrier(&mut self, node: NodeRef, i: usize, barrier: bool) {
        let child = match node.kind {
            NodeKind::Aligned(h) => &mut self.aligned_nodes[h].children[i],
            NodeKind::Quantized(h) => &mut self.quantized_nodes[h].children[i],
            NodeKind::Unaligned(h) => &mut self.unaligned_nodes[h].children[i],
            _ => return,
        };
        if barrier {
            child.set_barrier();
        } else {
            child.clear_barrier();
        }
    }

    /// Clears barriers in the part of the tree above and at the frontier.
    fn clear_barriers(&mut self, node: NodeRef) {
        for i in 0..self.children(node).len() {
            let child = self.children(node)[i];
            if child.barrier {
                self.set_child_barrier(node, i, false);
            } else if child.is_inner() {
                self.clear_barriers(child);
            }
        }
    }

    /// Computes the new boxes below `node` into `updates` and returns the box of `node`.
    /// Children flagged as barriers take their box from `frontier`.
    fn collect_refit(
        &self,
        node: NodeRef,
        scene: &dyn GeometryProvider,
        frontier: &HashMap<NodeKind, BoundingBox>,
        updates: &mut RefitUpdates<P, N>,
    ) -> BoundingBox {
        match node.kind {
            NodeKind::Leaf { block, count } => {
                let mut bounds = BoundingBox::EMPTY;
                for (i, prim) in self.leaf_blocks(block, count).iter().enumerate() {
                    let mut prim = prim.clone();
                    bounds.extend_box(&prim.update(scene));
                    updates.leaves.push((block.offset(i), prim));
                }
                bounds
            }
            NodeKind::Empty | NodeKind::Invalid => BoundingBox::EMPTY,
            _ => {
                let mut child_bounds = [BoundingBox::EMPTY; N];
                for (i, &child) in self.children(node).iter().enumerate() {
                    child_bounds[i] = if child.barrier {
                        frontier.get(&child.kind).copied().unwrap_or(BoundingBox::EMPTY)
                    } else {
                        self.collect_refit(child, scene, frontier, updates)
                    };
                }
                let bounds = child_bounds
                    .iter()
                    .fold(BoundingBox::EMPTY, |acc, b| acc.merge(b));
                updates.nodes.push((node, child_bounds));
                bounds
            }
        }
    }

    fn apply_refit(&mut self, updates: RefitUpdates<P, N>) {
        for (handle, prim) in updates.leaves {
            self.leaves[handle] = prim;
        }
        for (node, bounds) in updates.nodes {
            match node.kind {
                NodeKind::Aligned(h) => {
                    let aligned = &mut self.aligned_nodes[h];
                    for (i, b) in bounds.iter().enumerate() {
                        if !aligned.children[i].is_empty() {
                            aligned.set_bounds(i, b);
                        }
                    }
                }
                NodeKind::Quantized(h) => self.quantized_nodes[h].requantize(&bounds),
                NodeKind::Unaligned(h) => {
                    let unaligned = &mut self.unaligned_nodes[h];
                    for (i, b) in bounds.iter().enumerate() {
                        if !unaligned.children[i].is_empty() {
                            unaligned.refit_child(i, b);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{BuildSettings, BuilderKind, NodeEncoding};
    use crate::primitives::{ObjectPrim, Triangle4};
    use crate::ray::Ray;
    use crate::scene::{Scene, UserGeometry};
    use crate::test_support::{random_rays, random_triangles};
    use crate::trees::node::NodeKind;
    use crate::trees::tree::Bvh;
    use crate::utilities::bounding_box::BoundingBox;
    use glam::Vec3;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn check_translation(settings: &BuildSettings) {
        let mut scene = Scene::new();
        let geom_id = scene.add_triangle_mesh(random_triangles(5000, 50.0, 31));
        let mut bvh = Bvh::<Triangle4, 4>::build(&scene, settings).unwrap();
        let leaves = bvh.leaf_sets();
        let bounds = bvh.bounds();

        let offset = Vec3::new(10.0, -4.0, 2.5);
        scene.mesh_mut(geom_id).unwrap().translate(offset);
        bvh.refit(&scene);

        assert_eq!(bvh.leaf_sets(), leaves);
        approx::assert_relative_eq!(bvh.bounds().min, bounds.min + offset, max_relative = 1e-5);
        approx::assert_relative_eq!(bvh.bounds().max, bounds.max + offset, max_relative = 1e-5);
        assert!(bvh.validate(&scene).is_empty(), "{:?}", bvh.validate(&scene));
        assert!(bvh.children(bvh.root()).iter().all(|child| !child.barrier));

        let rebuilt = Bvh::<Triangle4, 4>::build(&scene, settings).unwrap();
        for ray in random_rays(100, 60.0, 2) {
            let refitted = bvh.intersect(&scene, &mut ray.clone());
            let fresh = rebuilt.intersect(&scene, &mut ray.clone());
            assert_eq!(refitted.map(|h| h.prim_id), fresh.map(|h| h.prim_id));
        }
    }

    #[test]
    fn test_serial_refit_after_translation() {
        for encoding in [NodeEncoding::Aligned, NodeEncoding::Quantized, NodeEncoding::Unaligned] {
            check_translation(
                &BuildSettings::default()
                    .with_encoding(encoding)
                    .with_refit_parallel_threshold(usize::MAX),
            );
        }
    }

    #[test]
    fn test_parallel_refit_after_translation() {
        for builder in [BuilderKind::Sah, BuilderKind::Morton] {
            for encoding in [NodeEncoding::Aligned, NodeEncoding::Quantized, NodeEncoding::Unaligned] {
                check_translation(
                    &BuildSettings::default()
                        .with_builder(builder)
                        .with_encoding(encoding)
                        .with_refit_parallel_threshold(0),
                );
            }
        }
    }

    #[test]
    fn test_refit_updates_aliased_object_leaves() {
        let shift = Arc::new(AtomicU32::new(0));
        let center = {
            let shift = shift.clone();
            move |i: u32| Vec3::new(2.0 * i as f32 + f32::from_bits(shift.load(Ordering::Relaxed)), 0.0, 0.0)
        };
        let bounds_center = center.clone();
        let mut scene = Scene::new();
        scene.add_user_geometry(UserGeometry::new(
            20,
            move |i| Some(BoundingBox::new(bounds_center(i) - 0.5, bounds_center(i) + 0.5)),
            move |i, ray: &Ray| {
                let t = center(i).z - ray.origin.z;
                let p = ray.at(t);
                ((p - center(i)).abs().max_element() <= 0.5 && t >= ray.tnear && t <= ray.tfar).then(|| {
                    crate::ray::Hit {
                        t,
                        ..Default::default()
                    }
                })
            },
        ));
        let mut bvh = Bvh::<ObjectPrim, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let side_ray = Ray::new(Vec3::new(100.0, 0.0, -5.0), Vec3::Z);
        assert!(bvh.intersect(&scene, &mut side_ray.clone()).is_none());

        shift.store(62.0f32.to_bits(), Ordering::Relaxed);
        bvh.refit(&scene);
        let hit = bvh.intersect(&scene, &mut side_ray.clone()).unwrap();
        assert_eq!(hit.prim_id, 19);
        assert!(matches!(bvh.root().kind, NodeKind::Aligned(_)));
        assert!(bvh.validate(&scene).is_empty());
    }
}
