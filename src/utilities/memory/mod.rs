//! Arena allocation for tree nodes and leaves.

pub mod arena;
