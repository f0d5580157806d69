//! Bounding volume hierarchies: node layouts, builders, traversal and maintenance.

pub mod node;
pub mod prim_ref;
pub mod prim_ref_builder;
pub mod quantized_node;
pub mod ray_batcher;
pub mod tree;
pub mod tree_binned_builder;
pub mod tree_diagnostics;
pub mod tree_morton_builder;
pub mod tree_ray_cast;
pub mod tree_refit;
pub mod tree_rotate;
pub mod unaligned_node;
pub mod user_builder;

pub use self::tree::{BytesEstimate, Bvh, ProgressFn};
pub use self::tree_diagnostics::BvhStatistics;
