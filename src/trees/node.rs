use super::ray_batcher::TreeRay;
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::memory::arena::Handle;
use glam::Vec3;

/// What a child slot points at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Unused slot.
    #[default]
    Empty,
    /// Placeholder for a slot that was never written. Never present in a finished tree.
    Invalid,
    Aligned(Handle),
    Unaligned(Handle),
    Quantized(Handle),
    /// `count` consecutive primitive blocks starting at `block` in the leaf arena.
    Leaf { block: Handle, count: u32 },
}

/// Reference to a node or leaf plus the refit barrier flag.
///
/// The barrier marks subtree roots refitted as independent tasks. Traversal ignores it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub barrier: bool,
}

impl NodeRef {
    pub const EMPTY: Self = Self {
        kind: NodeKind::Empty,
        barrier: false,
    };

    #[inline(always)]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            barrier: false,
        }
    }

    #[inline(always)]
    pub fn aligned(handle: Handle) -> Self {
        Self::new(NodeKind::Aligned(handle))
    }

    #[inline(always)]
    pub fn quantized(handle: Handle) -> Self {
        Self::new(NodeKind::Quantized(handle))
    }

    #[inline(always)]
    pub fn unaligned(handle: Handle) -> Self {
        Self::new(NodeKind::Unaligned(handle))
    }

    #[inline(always)]
    pub fn leaf(block: Handle, count: usize) -> Self {
        Self::new(NodeKind::Leaf {
            block,
            count: count as u32,
        })
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.kind == NodeKind::Empty
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Whether this refers to an inner node of any encoding.
    #[inline(always)]
    pub fn is_inner(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Aligned(_) | NodeKind::Unaligned(_) | NodeKind::Quantized(_)
        )
    }

    #[inline(always)]
    pub fn set_barrier(&mut self) {
        self.barrier = true;
    }

    #[inline(always)]
    pub fn clear_barrier(&mut self) {
        self.barrier = false;
    }
}

/// Tests a ray against an AABB defined by min/max.
/// Returns the entry distance if the segment overlaps the box.
#[inline(always)]
pub fn intersects_ray(min: Vec3, max: Vec3, ray: &TreeRay) -> Option<f32> {
    let t0 = min * ray.inverse_direction - ray.origin_over_direction;
    let t1 = max * ray.inverse_direction - ray.origin_over_direction;
    let t_exit = t0.max(t1);
    let t_entry = t0.min(t1);
    let earliest_exit = ray.maximum_t.min(t_exit.min_element());
    let t = ray.minimum_t.max(t_entry.max_element());
    (t <= earliest_exit).then_some(t)
}

/// Inner node with `N` axis-aligned child boxes stored per axis.
///
/// Children are packed to the front; unused slots are [`NodeRef::EMPTY`] with an inverted box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlignedNode<const N: usize> {
    pub children: [NodeRef; N],
    pub lower_x: [f32; N],
    pub upper_x: [f32; N],
    pub lower_y: [f32; N],
    pub upper_y: [f32; N],
    pub lower_z: [f32; N],
    pub upper_z: [f32; N],
}

impl<const N: usize> Default for AlignedNode<N> {
    fn default() -> Self {
        Self {
            children: [NodeRef::EMPTY; N],
            lower_x: [f32::INFINITY; N],
            upper_x: [f32::NEG_INFINITY; N],
            lower_y: [f32::INFINITY; N],
            upper_y: [f32::NEG_INFINITY; N],
            lower_z: [f32::INFINITY; N],
            upper_z: [f32::NEG_INFINITY; N],
        }
    }
}

impl<const N: usize> AlignedNode<N> {
    #[inline]
    pub fn set(&mut self, i: usize, child: NodeRef, bounds: &BoundingBox) {
        self.children[i] = child;
        self.set_bounds(i, bounds);
    }

    #[inline]
    pub fn set_bounds(&mut self, i: usize, bounds: &BoundingBox) {
        self.lower_x[i] = bounds.min.x;
        self.lower_y[i] = bounds.min.y;
        self.lower_z[i] = bounds.min.z;
        self.upper_x[i] = bounds.max.x;
        self.upper_y[i] = bounds.max.y;
        self.upper_z[i] = bounds.max.z;
    }

    #[inline(always)]
    pub fn child_bounds(&self, i: usize) -> BoundingBox {
        BoundingBox::new(
            Vec3::new(self.lower_x[i], self.lower_y[i], self.lower_z[i]),
            Vec3::new(self.upper_x[i], self.upper_y[i], self.upper_z[i]),
        )
    }

    /// Union of all child boxes.
    pub fn bounds(&self) -> BoundingBox {
        (0..N).fold(BoundingBox::EMPTY, |acc, i| acc.merge(&self.child_bounds(i)))
    }

    /// Number of non-empty slots.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// Slab test of every child. Writes entry distances of hit children and returns their mask.
    #[inline]
    pub fn intersect(&self, ray: &TreeRay, distances: &mut [f32; N]) -> u32 {
        let mut mask = 0;
        for i in 0..N {
            if self.children[i].is_empty() {
                break;
            }
            let min = Vec3::new(self.lower_x[i], self.lower_y[i], self.lower_z[i]);
            let max = Vec3::new(self.upper_x[i], self.upper_y[i], self.upper_z[i]);
            if let Some(t) = intersects_ray(min, max, ray) {
                distances[i] = t;
                mask |= 1 << i;
            }
        }
        mask
    }
}
