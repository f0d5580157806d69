//! Bounding volume hierarchies for ray tracing.
//!
//! Trees are built over a [`scene::GeometryProvider`] with a binned SAH or a Morton code
//! builder, stored with aligned, quantized or oriented nodes, traversed by single rays, packets
//! or streams, and refitted in place after geometry moves. [`accel::Accel`] ties a scene and its
//! tree together.

pub mod accel;
pub mod config;
pub mod error;
pub mod primitives;
pub mod ray;
pub mod scene;
pub mod trees;
pub mod utilities;

#[cfg(test)]
mod test_support;

pub use accel::{Accel, UpdateKind};
pub use config::BuildSettings;
pub use error::{BuildError, Result};
pub use trees::tree::Bvh;
