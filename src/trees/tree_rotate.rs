use super::node::{NodeKind, NodeRef};
use super::tree::Bvh;
use crate::primitives::Primitive;
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::memory::arena::Handle;

/// Exchange of child `child` of a node with grandchild `grandchild` below child `parent`.
#[derive(Clone, Copy, Debug)]
struct Rotation {
    child: usize,
    parent: usize,
    grandchild: usize,
    /// Box of `parent` after the exchange.
    bounds: BoundingBox,
    gain: f32,
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    /// Runs up to `rounds` passes of local rotations over an aligned tree and returns the total
    /// reduction of the summed child half-areas. Stops early once a pass finds nothing.
    ///
    /// A rotation swaps a child with a grandchild when that shrinks the box of the grandchild's
    /// parent. The node's own box and every other box stay the same, so the cost metric never
    /// increases. Subtrees behind a barrier are left alone.
    pub fn rotate(&mut self, rounds: usize) -> f32 {
        if !matches!(self.root.kind, NodeKind::Aligned(_)) {
            return 0.0;
        }
        let mut total = 0.0;
        for round in 0..rounds {
            let (gain, count) = self.rotate_subtree(self.root);
            log::debug!(
                "rotations round {}: {} swaps, half-area gain {}",
                round,
                count,
                gain
            );
            total += gain;
            if count == 0 {
                break;
            }
        }
        total
    }

    /// Rotates bottom up. Returns the gain and the number of rotations applied.
    fn rotate_subtree(&mut self, node: NodeRef) -> (f32, usize) {
        let NodeKind::Aligned(handle) = node.kind else {
            return (0.0, 0);
        };
        let mut gain = 0.0;
        let mut count = 0;
        let children = self.aligned_nodes[handle].children;
        for child in children {
            if child.barrier {
                continue;
            }
            let (child_gain, child_count) = self.rotate_subtree(child);
            gain += child_gain;
            count += child_count;
        }
        if let Some(rotation) = self.best_rotation(handle) {
            self.apply_rotation(handle, &rotation);
            gain += rotation.gain;
            count += 1;
        }
        (gain, count)
    }

    fn best_rotation(&self, handle: Handle) -> Option<Rotation> {
        let node = &self.aligned_nodes[handle];
        let mut best: Option<Rotation> = None;
        for parent in 0..N {
            let parent_ref = node.children[parent];
            let NodeKind::Aligned(parent_handle) = parent_ref.kind else {
                continue;
            };
            if parent_ref.barrier {
                continue;
            }
            let inner = &self.aligned_nodes[parent_handle];
            let area = node.child_bounds(parent).half_area();
            for grandchild in 0..N {
                if inner.children[grandchild].is_empty() {
                    continue;
                }
                for child in 0..N {
                    if child == parent || node.children[child].is_empty() || node.children[child].barrier {
                        continue;
                    }
                    let mut bounds = node.child_bounds(child);
                    for other in (0..N).filter(|&other| other != grandchild) {
                        bounds.extend_box(&inner.child_bounds(other));
                    }
                    let gain = area - bounds.half_area();
                    if gain > 0.0 && best.map_or(true, |b| gain > b.gain) {
                        best = Some(Rotation {
                            child,
                            parent,
                            grandchild,
                            bounds,
                            gain,
                        });
                    }
                }
            }
        }
        best
    }

    fn apply_rotation(&mut self, handle: Handle, rotation: &Rotation) {
        let NodeKind::Aligned(parent_handle) = self.aligned_nodes[handle].children[rotation.parent].kind else {
            return;
        };
        let node = self.aligned_nodes[handle];
        let inner = self.aligned_nodes[parent_handle];
        let moved_up = (inner.children[rotation.grandchild], inner.child_bounds(rotation.grandchild));
        let moved_down = (node.children[rotation.child], node.child_bounds(rotation.child));

        let inner = &mut self.aligned_nodes[parent_handle];
        inner.set(rotation.grandchild, moved_down.0, &moved_down.1);
        let node = &mut self.aligned_nodes[handle];
        node.set(rotation.child, moved_up.0, &moved_up.1);
        node.set_bounds(rotation.parent, &rotation.bounds);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{BuildSettings, BuilderKind};
    use crate::primitives::Triangle4;
    use crate::test_support::random_scene;
    use crate::trees::tree::Bvh;

    fn morton_settings() -> BuildSettings {
        BuildSettings::default()
            .with_builder(BuilderKind::Morton)
            .with_rotations(0, false)
    }

    #[test]
    fn test_rotations_never_increase_cost() {
        let scene = random_scene(3000, 8);
        let mut bvh = Bvh::<Triangle4, 4>::build(&scene, &morton_settings()).unwrap();
        let before = bvh.measure_cost_metric();
        let leaves_before = bvh.leaf_sets();
        let gain = bvh.rotate(3);
        let after = bvh.measure_cost_metric();
        assert!(gain >= 0.0);
        assert!(after <= before * (1.0 + 1e-6), "{after} > {before}");
        assert_eq!(bvh.leaf_sets(), leaves_before);
        assert!(bvh.validate(&scene).is_empty());
    }

    #[test]
    fn test_rotation_on_binary_tree_finds_gains() {
        let scene = random_scene(2000, 9);
        let mut bvh = Bvh::<Triangle4, 2>::build(&scene, &morton_settings()).unwrap();
        let before = bvh.measure_cost_metric();
        let gain = bvh.rotate(2);
        assert!(gain > 0.0);
        assert!(bvh.measure_cost_metric() < before);
        assert!(bvh.validate(&scene).is_empty());
    }

    #[test]
    fn test_forced_rotations_during_build() {
        let scene = random_scene(500, 10);
        let plain = Bvh::<Triangle4, 4>::build(&scene, &morton_settings()).unwrap();
        let rotated = Bvh::<Triangle4, 4>::build(
            &scene,
            &morton_settings().with_rotations(2, true),
        )
        .unwrap();
        assert!(rotated.measure_cost_metric() <= plain.measure_cost_metric() * (1.0 + 1e-6));
    }
}
