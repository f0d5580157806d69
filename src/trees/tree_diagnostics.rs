use super::node::{NodeKind, NodeRef};
use super::tree::Bvh;
use crate::primitives::Primitive;
use crate::scene::GeometryProvider;
use crate::utilities::bounding_box::BoundingBox;
use glam::Vec3;

/// Relative slack allowed when checking that stored boxes enclose recomputed ones.
const CONTAINMENT_EPSILON: f32 = 1e-5;

/// Shape and size of a built tree.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BvhStatistics {
    pub aligned_nodes: usize,
    pub quantized_nodes: usize,
    pub unaligned_nodes: usize,
    pub leaves: usize,
    pub leaf_blocks: usize,
    /// Primitives stored in leaves, counting every block slot.
    pub primitives: usize,
    pub max_depth: usize,
    /// Cost metric of the tree, see [`Bvh::measure_cost_metric`].
    pub sah_cost: f32,
    pub bytes: usize,
}

impl BvhStatistics {
    pub fn inner_nodes(&self) -> usize {
        self.aligned_nodes + self.quantized_nodes + self.unaligned_nodes
    }
}

/// `bounds` grown by the rounding error of coordinates of its magnitude.
fn padded(bounds: &BoundingBox) -> BoundingBox {
    let magnitude = bounds.min.abs().max(bounds.max.abs()).max_element();
    let pad = Vec3::splat(magnitude * CONTAINMENT_EPSILON + f32::MIN_POSITIVE);
    BoundingBox::new(bounds.min - pad, bounds.max + pad)
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    pub fn statistics(&self) -> BvhStatistics {
        let mut stats = BvhStatistics {
            max_depth: self.compute_maximum_depth(),
            sah_cost: self.measure_cost_metric(),
            bytes: {
                let estimate = self.bytes_estimate();
                estimate.node_bytes + estimate.leaf_bytes
            },
            ..Default::default()
        };
        self.gather_statistics(self.root, &mut stats);
        stats
    }

    fn gather_statistics(&self, node: NodeRef, stats: &mut BvhStatistics) {
        match node.kind {
            NodeKind::Leaf { block, count } => {
                stats.leaves += 1;
                stats.leaf_blocks += count as usize;
                stats.primitives += self
                    .leaf_blocks(block, count)
                    .iter()
                    .map(Primitive::size)
                    .sum::<usize>();
            }
            NodeKind::Aligned(_) => stats.aligned_nodes += 1,
            NodeKind::Quantized(_) => stats.quantized_nodes += 1,
            NodeKind::Unaligned(_) => stats.unaligned_nodes += 1,
            NodeKind::Empty | NodeKind::Invalid => {}
        }
        for &child in self.children(node) {
            self.gather_statistics(child, stats);
        }
    }

    /// Expected cost of a random ray query relative to the root box:
    /// `sum(traversal_cost * inner_area) + sum(intersection_cost * leaf_area * blocks)`, divided by
    /// the root half-area. Node areas are those stored in their parents.
    pub fn measure_cost_metric(&self) -> f32 {
        let root_area = self.bounds.half_area();
        if self.is_empty() || root_area <= 0.0 {
            return 0.0;
        }
        self.measure_cost(self.root, root_area) / root_area
    }

    fn measure_cost(&self, node: NodeRef, area: f32) -> f32 {
        match node.kind {
            NodeKind::Leaf { count, .. } => self.settings.intersection_cost * area * count as f32,
            NodeKind::Empty | NodeKind::Invalid => 0.0,
            _ => {
                let own = self.settings.traversal_cost * area;
                let children = self.children(node);
                own + children
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| !child.is_empty())
                    .map(|(i, &child)| self.measure_cost(child, self.child_bounds(node, i).half_area()))
                    .sum::<f32>()
            }
        }
    }

    /// Number of nodes on the longest root to leaf path. A lone leaf has depth 1.
    pub fn compute_maximum_depth(&self) -> usize {
        self.compute_depth(self.root)
    }

    fn compute_depth(&self, node: NodeRef) -> usize {
        match node.kind {
            NodeKind::Empty | NodeKind::Invalid => 0,
            NodeKind::Leaf { .. } => 1,
            _ => {
                1 + self
                    .children(node)
                    .iter()
                    .map(|&child| self.compute_depth(child))
                    .max()
                    .unwrap_or(0)
            }
        }
    }

    /// `(geom_id, prim_id)` of every leaf, each sorted, with the leaves sorted too.
    pub fn leaf_sets(&self) -> Vec<Vec<(u32, u32)>> {
        let mut sets = Vec::new();
        self.gather_leaf_sets(self.root, &mut sets);
        sets.sort_unstable();
        sets
    }

    fn gather_leaf_sets(&self, node: NodeRef, sets: &mut Vec<Vec<(u32, u32)>>) {
        if let NodeKind::Leaf { block, count } = node.kind {
            let mut set: Vec<(u32, u32)> = self
                .leaf_blocks(block, count)
                .iter()
                .flat_map(|prim| (0..prim.size()).map(move |slot| prim.id(slot)))
                .collect();
            set.sort_unstable();
            sets.push(set);
            return;
        }
        for &child in self.children(node) {
            self.gather_leaf_sets(child, sets);
        }
    }

    /// Checks the structural invariants of the tree against `scene` and describes every
    /// violation found. An empty list means the tree is sound.
    ///
    /// Checked: every stored child box encloses the primitives below it, children are packed to
    /// the front, no inner node is empty, no `Invalid` references remain, no barrier is left set,
    /// leaves are non-empty with full blocks except possibly the last, and the leaves hold
    /// exactly the built primitive count. In a pre-split tree a box only has to overlap the
    /// primitives below it, since each piece covers part of its primitive.
    pub fn validate(&self, scene: &dyn GeometryProvider) -> Vec<String> {
        let mut errors = Vec::new();
        if self.is_empty() {
            if self.prim_count != 0 {
                errors.push(format!("empty root with {} primitives", self.prim_count));
            }
            return errors;
        }
        let actual = self.subtree_bounds(scene, self.root);
        if !self.bounds_cover(&self.bounds, &actual) {
            errors.push(format!("tree bounds {:?} do not enclose {:?}", self.bounds, actual));
        }
        self.validate_node(self.root, scene, 0, &mut errors);
        let primitives = self.statistics().primitives;
        if primitives != self.prim_count {
            errors.push(format!(
                "leaves hold {} primitives, expected {}",
                primitives, self.prim_count
            ));
        }
        errors
    }

    fn bounds_cover(&self, stored: &BoundingBox, actual: &BoundingBox) -> bool {
        if self.is_presplit() {
            padded(stored).overlaps(actual)
        } else {
            padded(stored).encloses(actual)
        }
    }

    fn validate_node(&self, node: NodeRef, scene: &dyn GeometryProvider, depth: usize, errors: &mut Vec<String>) {
        if node.barrier {
            errors.push(format!("barrier left set on {:?} at depth {}", node.kind, depth));
        }
        match node.kind {
            NodeKind::Invalid => errors.push(format!("invalid reference at depth {depth}")),
            NodeKind::Empty => {}
            NodeKind::Leaf { block, count } => {
                let blocks = self.leaf_blocks(block, count);
                if blocks.is_empty() {
                    errors.push(format!("empty leaf at depth {depth}"));
                }
                let partial = blocks
                    .iter()
                    .take(blocks.len().saturating_sub(1))
                    .any(|prim| prim.size() != P::max_size());
                if partial {
                    errors.push(format!("leaf at depth {depth} has a partial block before its last"));
                }
            }
            _ => {
                let children = self.children(node);
                if children.first().map_or(true, NodeRef::is_empty) {
                    errors.push(format!("inner node without children at depth {depth}"));
                }
                let mut seen_empty = false;
                for (i, &child) in children.iter().enumerate() {
                    if child.is_empty() {
                        seen_empty = true;
                        continue;
                    }
                    if seen_empty {
                        errors.push(format!("child {i} follows an empty slot at depth {depth}"));
                    }
                    // Oriented children are checked through the world box around them.
                    let actual = self.subtree_bounds(scene, child);
                    let stored = self.child_bounds(node, i);
                    if !self.bounds_cover(&stored, &actual) {
                        errors.push(format!(
                            "child {i} at depth {depth} does not enclose its subtree {:?}",
                            actual
                        ));
                    }
                    self.validate_node(child, scene, depth + 1, errors);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildSettings, BuilderKind, NodeEncoding};
    use crate::primitives::{ObjectPrim, Triangle4};
    use crate::scene::Scene;
    use crate::test_support::{random_scene, sphere_row};

    #[test]
    fn test_every_configuration_is_valid_and_complete() {
        let scene = random_scene(1500, 40);
        let expected: Vec<(u32, u32)> = (0..1500).map(|i| (0, i)).collect();
        for builder in [BuilderKind::Sah, BuilderKind::Morton] {
            for encoding in [NodeEncoding::Aligned, NodeEncoding::Quantized, NodeEncoding::Unaligned] {
                let settings = BuildSettings::default()
                    .with_builder(builder)
                    .with_encoding(encoding);
                let bvh4 = Bvh::<Triangle4, 4>::build(&scene, &settings).unwrap();
                let bvh8 = Bvh::<Triangle4, 8>::build(&scene, &settings).unwrap();
                assert_eq!(bvh4.validate(&scene), Vec::<String>::new(), "{builder} {encoding}");
                assert_eq!(bvh8.validate(&scene), Vec::<String>::new(), "{builder} {encoding}");

                let mut ids: Vec<(u32, u32)> = bvh4.leaf_sets().into_iter().flatten().collect();
                ids.sort_unstable();
                assert_eq!(ids, expected);
            }
        }
    }

    #[test]
    fn test_statistics() {
        let scene = random_scene(1000, 41);
        let bvh = Bvh::<Triangle4, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let stats = bvh.statistics();
        assert_eq!(stats.primitives, 1000);
        assert_eq!(stats.quantized_nodes + stats.unaligned_nodes, 0);
        assert!(stats.aligned_nodes > 0);
        assert!(stats.leaves >= 1000 / 8);
        assert!(stats.max_depth >= 2 && stats.max_depth <= 33);
        assert!(stats.sah_cost > 1.0);
        assert!(stats.bytes > 0);
    }

    #[test]
    fn test_single_leaf_tree() {
        let mut scene = Scene::new();
        scene.add_user_geometry(sphere_row(1));
        let bvh = Bvh::<ObjectPrim, 4>::build(&scene, &BuildSettings::default()).unwrap();
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.compute_maximum_depth(), 1);
        assert!(bvh.validate(&scene).is_empty());
        approx::assert_relative_eq!(bvh.measure_cost_metric(), 1.0);
    }

    #[test]
    fn test_validate_reports_shrunken_box() {
        let scene = random_scene(200, 42);
        let mut bvh = Bvh::<Triangle4, 4>::build(&scene, &BuildSettings::default()).unwrap();
        let NodeKind::Aligned(root) = bvh.root().kind else {
            panic!("expected an aligned root");
        };
        bvh.aligned_nodes[root].set_bounds(0, &BoundingBox::EMPTY);
        assert!(!bvh.validate(&scene).is_empty());
    }
}
