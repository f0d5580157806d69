use super::node::{AlignedNode, NodeKind, NodeRef};
use super::prim_ref::{PrimInfo, PrimRef};
use super::prim_ref_builder::create_prim_ref_array;
use super::quantized_node::QuantizedNode;
use super::tree_binned_builder::{BinnedBuilder, BinnedSettings, BuildCallbacks, BuiltChild};
use super::tree_morton_builder::{MortonBuilder, MortonSettings};
use super::unaligned_node::{bounds_in_space, compute_aligned_space, UnalignedNode};
use super::user_builder::presplit;
use crate::config::{BuildQuality, BuildSettings, BuilderKind, NodeEncoding};
use crate::error::Result;
use crate::primitives::Primitive;
use crate::scene::GeometryProvider;
use crate::utilities::bounding_box::BoundingBox;
use crate::utilities::memory::arena::{
    ArenaStorage, CachedAllocator, FastAllocator, Handle, MemoryLimit,
};
use crate::utilities::thread_dispatcher::ThreadDispatcher;
use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

/// Entries of the fixed part of a traversal stack.
pub const TRAVERSAL_STACK_CAPACITY: usize = 256;

/// Progress hook of a build. Receives the number of references just placed in leaves.
pub type ProgressFn<'a> = &'a (dyn Fn(usize) -> bool + Sync);

/// Byte sizes used to pre-size the arenas of a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BytesEstimate {
    pub node_bytes: usize,
    pub leaf_bytes: usize,
}

/// An `N`-wide bounding volume hierarchy over leaves of primitive type `P`.
///
/// Built once, then read-only during traversal. Refitting mutates bounds in place and requires
/// exclusive access. A rebuild produces a fresh tree.
pub struct Bvh<P: Primitive, const N: usize> {
    pub(crate) root: NodeRef,
    pub(crate) bounds: BoundingBox,
    pub(crate) aligned_nodes: ArenaStorage<AlignedNode<N>>,
    pub(crate) quantized_nodes: ArenaStorage<QuantizedNode<N>>,
    pub(crate) unaligned_nodes: ArenaStorage<UnalignedNode<N>>,
    pub(crate) leaves: ArenaStorage<P>,
    pub(crate) prim_count: usize,
    /// Valid primitives of the scene at build time. Below `prim_count` once pre-splitting added
    /// references.
    pub(crate) scene_prim_count: usize,
    pub(crate) settings: BuildSettings,
    pub(crate) dispatcher: ThreadDispatcher,
}

impl<P: Primitive, const N: usize> std::fmt::Debug for Bvh<P, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bvh")
            .field("primitive", &P::NAME)
            .field("branching_factor", &N)
            .field("root", &self.root)
            .field("bounds", &self.bounds)
            .field("prim_count", &self.prim_count)
            .field("scene_prim_count", &self.scene_prim_count)
            .finish_non_exhaustive()
    }
}

/// The arenas of one build, drawing on a single byte budget.
pub(crate) struct BvhAllocators<P, const N: usize> {
    pub aligned: FastAllocator<AlignedNode<N>>,
    pub quantized: FastAllocator<QuantizedNode<N>>,
    pub unaligned: FastAllocator<UnalignedNode<N>>,
    pub leaves: FastAllocator<P>,
    pub limit: Arc<MemoryLimit>,
}

impl<P, const N: usize> BvhAllocators<P, N> {
    pub fn new(max_bytes: usize) -> Self {
        let limit = MemoryLimit::new(max_bytes);
        Self {
            aligned: FastAllocator::with_limit(limit.clone()),
            quantized: FastAllocator::with_limit(limit.clone()),
            unaligned: FastAllocator::with_limit(limit.clone()),
            leaves: FastAllocator::with_limit(limit.clone()),
            limit,
        }
    }

    pub fn init_estimate(&self, encoding: NodeEncoding, estimate: BytesEstimate) {
        match encoding {
            NodeEncoding::Aligned => self.aligned.init_estimate(estimate.node_bytes),
            NodeEncoding::Quantized => self.quantized.init_estimate(estimate.node_bytes),
            NodeEncoding::Unaligned => self.unaligned.init_estimate(estimate.node_bytes),
        }
        self.leaves.init_estimate(estimate.leaf_bytes);
    }
}

/// Per-thread handles into [`BvhAllocators`], fetched on first use.
pub(crate) struct BvhCachedAllocator<'a, P, const N: usize> {
    allocs: &'a BvhAllocators<P, N>,
    aligned: Option<CachedAllocator<'a, AlignedNode<N>>>,
    quantized: Option<CachedAllocator<'a, QuantizedNode<N>>>,
    unaligned: Option<CachedAllocator<'a, UnalignedNode<N>>>,
    leaves: Option<CachedAllocator<'a, P>>,
}

impl<'a, P, const N: usize> BvhCachedAllocator<'a, P, N> {
    pub fn new(allocs: &'a BvhAllocators<P, N>) -> Self {
        Self {
            allocs,
            aligned: None,
            quantized: None,
            unaligned: None,
            leaves: None,
        }
    }

    pub fn aligned(&mut self) -> &mut CachedAllocator<'a, AlignedNode<N>> {
        let allocs = self.allocs;
        self.aligned
            .get_or_insert_with(|| allocs.aligned.get_cached_allocator())
    }

    pub fn quantized(&mut self) -> &mut CachedAllocator<'a, QuantizedNode<N>> {
        let allocs = self.allocs;
        self.quantized
            .get_or_insert_with(|| allocs.quantized.get_cached_allocator())
    }

    pub fn unaligned(&mut self) -> &mut CachedAllocator<'a, UnalignedNode<N>> {
        let allocs = self.allocs;
        self.unaligned
            .get_or_insert_with(|| allocs.unaligned.get_cached_allocator())
    }

    pub fn leaves(&mut self) -> &mut CachedAllocator<'a, P> {
        let allocs = self.allocs;
        self.leaves
            .get_or_insert_with(|| allocs.leaves.get_cached_allocator())
    }
}

/// Builder hooks producing [`Bvh`] nodes in the configured encoding.
pub(crate) struct BvhCallbacks<'s, P, const N: usize> {
    pub allocs: &'s BvhAllocators<P, N>,
    pub scene: &'s dyn GeometryProvider,
    pub encoding: NodeEncoding,
    /// Leaf arena block the reference array will be donated to, for aliasing primitive types.
    pub shared_block: Option<u32>,
    pub progress: Option<ProgressFn<'s>>,
}

impl<'s, P: Primitive, const N: usize> BvhCallbacks<'s, P, N> {
    fn aligned_node(children: &[BuiltChild<'_, NodeRef>]) -> AlignedNode<N> {
        let mut node = AlignedNode::<N>::default();
        for (i, child) in children.iter().enumerate() {
            node.set(i, child.node, &child.bounds);
        }
        node
    }
}

impl<'s, P: Primitive, const N: usize> BuildCallbacks for BvhCallbacks<'s, P, N> {
    type Node = NodeRef;
    type Alloc<'a>
        = BvhCachedAllocator<'a, P, N>
    where
        Self: 'a;

    fn cached_allocator(&self) -> Self::Alloc<'_> {
        BvhCachedAllocator::new(self.allocs)
    }

    fn create_node<'a>(
        &'a self,
        alloc: &mut Self::Alloc<'a>,
        children: &[BuiltChild<'_, NodeRef>],
    ) -> Result<NodeRef> {
        debug_assert!(
            children.len() >= 2 && children.len() <= N,
            "Inner nodes hold between two and N children."
        );
        match self.encoding {
            NodeEncoding::Aligned => {
                let node = Self::aligned_node(children);
                Ok(NodeRef::aligned(alloc.aligned().alloc(node)?))
            }
            NodeEncoding::Quantized => {
                let node = QuantizedNode::from_aligned(&Self::aligned_node(children));
                Ok(NodeRef::quantized(alloc.quantized().alloc(node)?))
            }
            NodeEncoding::Unaligned => {
                let mut node = UnalignedNode::<N>::default();
                for (i, child) in children.iter().enumerate() {
                    let space = compute_aligned_space(child.prims);
                    let bounds = bounds_in_space(&space, child.prims.iter().map(PrimRef::bounds));
                    node.set(i, child.node, space, &bounds);
                }
                Ok(NodeRef::unaligned(alloc.unaligned().alloc(node)?))
            }
        }
    }

    fn create_leaf<'a>(
        &'a self,
        alloc: &mut Self::Alloc<'a>,
        prims: &[PrimRef],
        begin: usize,
    ) -> Result<NodeRef> {
        if let Some(block) = self.shared_block {
            return Ok(NodeRef::leaf(Handle::new(block, begin as u32), prims.len()));
        }
        let blocks = prims
            .chunks(P::max_size())
            .map(|chunk| P::fill(chunk, self.scene));
        let handle = alloc.leaves().alloc_slice(blocks)?;
        Ok(NodeRef::leaf(handle, P::blocks(prims.len())))
    }

    fn progress(&self, delta: usize) -> bool {
        self.progress.map_or(true, |progress| progress(delta))
    }
}

impl<P: Primitive, const N: usize> Bvh<P, N> {
    /// A tree without primitives. Intersects nothing.
    pub fn empty(settings: BuildSettings) -> Self {
        Self {
            root: NodeRef::EMPTY,
            bounds: BoundingBox::EMPTY,
            aligned_nodes: ArenaStorage::default(),
            quantized_nodes: ArenaStorage::default(),
            unaligned_nodes: ArenaStorage::default(),
            leaves: ArenaStorage::default(),
            prim_count: 0,
            scene_prim_count: 0,
            settings,
            dispatcher: ThreadDispatcher::global(),
        }
    }

    /// Builds a tree over all valid primitives of `scene`.
    pub fn build(scene: &dyn GeometryProvider, settings: &BuildSettings) -> Result<Self> {
        Self::build_with(scene, settings, None, None)
    }

    /// Builds with an optional arena size hint (typically the previous tree's
    /// [`Bvh::bytes_estimate`]) and an optional progress hook that may cancel the build.
    pub fn build_with(
        scene: &dyn GeometryProvider,
        settings: &BuildSettings,
        hint: Option<BytesEstimate>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Self> {
        settings.validate(N)?;
        let dispatcher = ThreadDispatcher::with_threads(settings.threads)?;
        let mut bvh =
            dispatcher.install(|| Self::build_internal(scene, settings, hint, progress))?;
        bvh.dispatcher = dispatcher;
        Ok(bvh)
    }

    /// Rough arena sizes for `prim_count` references.
    pub fn estimate_bytes(prim_count: usize, settings: &BuildSettings) -> BytesEstimate {
        let refs_per_leaf = settings.max_leaf_size.min(2 * P::max_size()).max(1);
        let leaf_count = prim_count.div_ceil(refs_per_leaf);
        let node_count = leaf_count.div_ceil(N - 1).max(1);
        let node_size = match settings.encoding {
            NodeEncoding::Aligned => size_of::<AlignedNode<N>>(),
            NodeEncoding::Quantized => size_of::<QuantizedNode<N>>(),
            NodeEncoding::Unaligned => size_of::<UnalignedNode<N>>(),
        };
        let leaf_bytes = if P::ALIASES_PRIM_REFS {
            0
        } else {
            (P::blocks(prim_count) + leaf_count) * size_of::<P>()
        };
        BytesEstimate {
            node_bytes: node_count * node_size * 6 / 5,
            leaf_bytes: leaf_bytes * 6 / 5,
        }
    }

    fn build_internal(
        scene: &dyn GeometryProvider,
        settings: &BuildSettings,
        hint: Option<BytesEstimate>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Self> {
        let start = Instant::now();
        let (mut prims, mut info) = create_prim_ref_array(scene);
        if info.is_empty() {
            log::info!("bvh{}<{}>: no valid primitives, empty tree", N, P::NAME);
            return Ok(Self::empty(settings.clone()));
        }
        let scene_prim_count = info.size();
        if settings.quality == BuildQuality::High {
            let budget = (settings.presplit_budget * scene_prim_count as f32) as usize;
            prims.resize(scene_prim_count + budget, PrimRef::default());
            let count = presplit(
                &mut prims,
                scene_prim_count,
                settings.presplit_factor,
                budget,
                |prim, axis, position| {
                    let geometry = scene.geometry(prim.geom_id)?;
                    Some(geometry.split_bounds(prim.prim_id, &prim.bounds(), axis, position))
                },
            );
            prims.truncate(count);
            info = PrimInfo::from_prims(&prims, 0);
        }
        let prim_count = info.size();

        let allocs = BvhAllocators::<P, N>::new(settings.max_bytes);
        let estimate = hint.unwrap_or_else(|| Self::estimate_bytes(prim_count, settings));
        allocs.init_estimate(settings.encoding, estimate);
        let single_thread_threshold = settings.single_thread_threshold.unwrap_or_else(|| {
            allocs.leaves.single_thread_threshold(
                N,
                prim_count,
                estimate.node_bytes + estimate.leaf_bytes,
            )
        });
        log::debug!(
            "bvh{}<{}>: estimate {:?}, single thread threshold {}",
            N,
            P::NAME,
            estimate,
            single_thread_threshold
        );

        let shared_block = P::ALIASES_PRIM_REFS.then(|| allocs.leaves.reserve_shared());
        let callbacks = BvhCallbacks {
            allocs: &allocs,
            scene,
            encoding: settings.encoding,
            shared_block,
            progress,
        };
        let (root, prims) = match settings.builder {
            BuilderKind::Sah => {
                let mut prims = prims;
                let builder = BinnedBuilder::new(
                    &callbacks,
                    BinnedSettings {
                        branching_factor: N,
                        min_leaf_size: settings.min_leaf_size,
                        max_leaf_size: settings.max_leaf_size,
                        traversal_cost: settings.traversal_cost,
                        intersection_cost: settings.intersection_cost,
                        max_depth: settings.max_depth,
                        log_block_size: Self::log_block_size(settings),
                        single_thread_threshold,
                    },
                );
                let root = builder.build(&mut prims, info)?;
                (root, prims)
            }
            BuilderKind::Morton => {
                let builder = MortonBuilder::new(
                    &callbacks,
                    MortonSettings {
                        branching_factor: N,
                        max_leaf_size: settings.max_leaf_size,
                        max_depth: settings.max_depth,
                        single_thread_threshold,
                    },
                );
                builder.build(prims, info)?
            }
        };
        // Every leaf exists now; the references can be handed over.
        if let Some(block) = shared_block {
            allocs.leaves.share_into(block, P::alias(prims));
        }
        log::debug!(
            "bvh{}<{}>: arenas reserved {} bytes, leaves {:?}",
            N,
            P::NAME,
            allocs.limit.reserved(),
            allocs.leaves.statistics()
        );

        let mut bvh = Self {
            root,
            bounds: info.geom_bounds(),
            aligned_nodes: allocs.aligned.into_storage(),
            quantized_nodes: allocs.quantized.into_storage(),
            unaligned_nodes: allocs.unaligned.into_storage(),
            leaves: allocs.leaves.into_storage(),
            prim_count,
            scene_prim_count,
            settings: settings.clone(),
            dispatcher: ThreadDispatcher::global(),
        };

        if settings.builder == BuilderKind::Morton && settings.quality != BuildQuality::Low {
            let wanted = settings.force_rotations || prim_count >= settings.rotation_min_prims;
            if wanted && settings.rotation_rounds > 0 {
                bvh.rotate(settings.rotation_rounds);
            }
        }

        log::info!(
            "bvh{}<{}>: {} builder, {} encoding, {} primitives in {:.2?}",
            N,
            P::NAME,
            settings.builder,
            settings.encoding,
            prim_count,
            start.elapsed()
        );
        Ok(bvh)
    }

    fn log_block_size(settings: &BuildSettings) -> u32 {
        settings
            .log_block_size
            .unwrap_or_else(|| P::max_size().max(1).ilog2())
    }

    #[inline(always)]
    pub fn root(&self) -> NodeRef {
        self.root
    }

    /// Bounds of everything in the tree.
    #[inline(always)]
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// Number of primitive references the tree was built from.
    #[inline(always)]
    pub fn prim_count(&self) -> usize {
        self.prim_count
    }

    /// Number of valid scene primitives the tree was built over. Equal to
    /// [`Bvh::prim_count`] unless pre-splitting duplicated references.
    #[inline(always)]
    pub fn scene_prim_count(&self) -> usize {
        self.scene_prim_count
    }

    /// Whether some primitives are referenced from more than one leaf, each time under a box
    /// covering only part of the primitive.
    #[inline(always)]
    pub fn is_presplit(&self) -> bool {
        self.prim_count > self.scene_prim_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Actual arena sizes of this tree, usable as the hint of the next rebuild.
    pub fn bytes_estimate(&self) -> BytesEstimate {
        BytesEstimate {
            node_bytes: self.aligned_nodes.bytes()
                + self.quantized_nodes.bytes()
                + self.unaligned_nodes.bytes(),
            leaf_bytes: self.leaves.bytes(),
        }
    }

    /// Primitive blocks of a leaf.
    #[inline(always)]
    pub fn leaf_blocks(&self, block: Handle, count: u32) -> &[P] {
        self.leaves.slice(block, count as usize)
    }

    /// Children of an inner node of any encoding. Empty for leaves and empty refs.
    pub fn children(&self, node: NodeRef) -> &[NodeRef] {
        match node.kind {
            NodeKind::Aligned(h) => &self.aligned_nodes[h].children,
            NodeKind::Quantized(h) => &self.quantized_nodes[h].children,
            NodeKind::Unaligned(h) => &self.unaligned_nodes[h].children,
            _ => &[],
        }
    }

    /// Axis-aligned box of child `i` of an inner node, as stored (decoded for quantized nodes,
    /// the world box of the oriented box for unaligned nodes).
    pub fn child_bounds(&self, node: NodeRef, i: usize) -> BoundingBox {
        match node.kind {
            NodeKind::Aligned(h) => self.aligned_nodes[h].child_bounds(i),
            NodeKind::Quantized(h) => self.quantized_nodes[h].child_bounds(i),
            NodeKind::Unaligned(h) => self.unaligned_nodes[h].child_world_bounds(i),
            _ => BoundingBox::EMPTY,
        }
    }

    /// Info of every reference in leaves below `node`, recomputed from the primitives.
    pub(crate) fn subtree_bounds(&self, scene: &dyn GeometryProvider, node: NodeRef) -> BoundingBox {
        match node.kind {
            NodeKind::Leaf { block, count } => self
                .leaf_blocks(block, count)
                .iter()
                .fold(BoundingBox::EMPTY, |acc, prim| acc.merge(&prim.bounds(scene))),
            NodeKind::Empty | NodeKind::Invalid => BoundingBox::EMPTY,
            _ => self
                .children(node)
                .iter()
                .fold(BoundingBox::EMPTY, |acc, &child| {
                    acc.merge(&self.subtree_bounds(scene, child))
                }),
        }
    }
}
