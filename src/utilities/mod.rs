pub mod bounding_box;
pub mod collections;
pub mod memory;
pub mod thread_dispatcher;
