//! Per-group virtual address leasing

mod allocator;
mod pool;

pub use allocator::Allocator;
pub use pool::Pool;
