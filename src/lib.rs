// src/lib.rs
//! Slop Engine resource subsystem.
//!
//! Turns file paths into generation-checked handles to GPU-ready textures,
//! models and materials without blocking the thread that owns the device.
//!
//! - [`ResourceManager`]: pools, path caches and synchronous loads.
//! - [`AsyncResourceLoader`]: worker-thread decoding with a main-thread drain.
//! - [`GpuBackend`]: the graphics-context seam ([`WgpuBackend`], [`HeadlessBackend`]).
//! - [`AssetDecoder`]: the file-format seam ([`FileDecoder`]).

pub mod asset;
pub mod async_loader;
pub mod error;
pub mod gltf_loader;
pub mod gpu;
pub mod offload;
pub mod resource_manager;
pub mod texture_importer;

#[cfg(test)]
mod test_support;

pub use asset::{AssetDecoder, FileDecoder, LoadStatus, ResourceKind};
pub use async_loader::{AsyncResourceLoader, LoadFuture, LoadRequestInfo, LoaderConfig};
pub use error::{Error, Result};
pub use gltf_loader::{ModelData, ModelDesc};
pub use gpu::{GpuBackend, Handle, HeadlessBackend, MaterialParams, ResourcePool, WgpuBackend};
pub use offload::Priority;
pub use resource_manager::{
    Material, MaterialDesc, MaterialHandle, Model, ModelHandle, ResourceConfig, ResourceManager,
    ResourceStats, Texture, TextureHandle,
};
pub use texture_importer::{ImportError, TextureData, TextureDesc};
