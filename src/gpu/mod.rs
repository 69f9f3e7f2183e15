// src/gpu/mod.rs
//! Handle, pool and backend layer. Nothing in here decodes files.

pub mod backend;
pub mod handle;
pub mod resource_pool;

pub use backend::{GpuBackend, HeadlessBackend, MaterialParams, WgpuBackend};
pub use handle::Handle;
pub use resource_pool::ResourcePool;
