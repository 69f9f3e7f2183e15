// src/resource_manager.rs
//! Resource Manager
//! - Pools: one generational pool per kind (textures, models, materials)
//! - Caching: path + options hash -> handle, material name -> handle
//! - Uploads: synchronous, through the `GpuBackend` on the owning thread
//! - Lifetime: ref counted; `release` only decrements, `release_unused` frees
//!
//! Every mutating call takes `&mut self`, so pools and caches always change
//! together and only on the thread that owns the manager.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::asset::{format_bytes, AssetDecoder, FileDecoder};
use crate::error::{Error, Result};
use crate::gltf_loader::{Aabb, ModelData, ModelDesc};
use crate::gpu::backend::{GpuBackend, MaterialParams};
use crate::gpu::handle::Handle;
use crate::gpu::resource_pool::ResourcePool;
use crate::texture_importer::{TextureData, TextureDesc, TextureFormat};

// ---------- Config ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// `new` returns an already initialized manager.
    pub auto_initialize: bool,
    /// Slots reserved up front in each pool.
    pub initial_capacity: usize,
    /// Options used by callers that do not pick their own.
    pub texture_defaults: TextureDesc,
    pub model_defaults: ModelDesc,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            auto_initialize: true,
            initial_capacity: 64,
            texture_defaults: TextureDesc::default(),
            model_defaults: ModelDesc::default(),
        }
    }
}

impl ResourceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ---------- Resources ----------

pub struct Texture<B: GpuBackend> {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub size_bytes: u64,
    pub gpu: B::Texture,
}

pub struct Mesh<B: GpuBackend> {
    pub name: String,
    pub vertex_count: u32,
    pub index_count: u32,
    pub material_index: Option<usize>,
    pub aabb: Aabb,
    pub gpu: B::Mesh,
}

pub struct Model<B: GpuBackend> {
    pub path: PathBuf,
    pub meshes: Vec<Mesh<B>>,
    pub aabb: Option<Aabb>,
    pub size_bytes: u64,
}

pub struct Material<B: GpuBackend> {
    pub name: String,
    pub params: MaterialParams,
    pub albedo: Option<TextureHandle<B>>,
    pub normal: Option<TextureHandle<B>>,
    pub metallic_roughness: Option<TextureHandle<B>>,
    pub occlusion: Option<TextureHandle<B>>,
    pub gpu: B::Material,
}

pub type TextureHandle<B> = Handle<Texture<B>>;
pub type ModelHandle<B> = Handle<Model<B>>;
pub type MaterialHandle<B> = Handle<Material<B>>;

/// Inputs for [`ResourceManager::create_material`]. Texture handles are stored
/// as given; the material does not keep them alive.
pub struct MaterialDesc<B: GpuBackend> {
    pub base_color: [f32; 4],
    pub emissive: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub ao: f32,
    pub albedo: Option<TextureHandle<B>>,
    pub normal: Option<TextureHandle<B>>,
    pub metallic_roughness: Option<TextureHandle<B>>,
    pub occlusion: Option<TextureHandle<B>>,
}

impl<B: GpuBackend> Clone for MaterialDesc<B> {
    fn clone(&self) -> Self {
        Self {
            base_color: self.base_color,
            emissive: self.emissive,
            metallic: self.metallic,
            roughness: self.roughness,
            ao: self.ao,
            albedo: self.albedo,
            normal: self.normal,
            metallic_roughness: self.metallic_roughness,
            occlusion: self.occlusion,
        }
    }
}

impl<B: GpuBackend> Default for MaterialDesc<B> {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            emissive: [0.0; 3],
            metallic: 0.0,
            roughness: 0.5,
            ao: 1.0,
            albedo: None,
            normal: None,
            metallic_roughness: None,
            occlusion: None,
        }
    }
}

impl<B: GpuBackend> MaterialDesc<B> {
    pub fn params(&self) -> MaterialParams {
        let bound = |slot: Option<TextureHandle<B>>, flag: u32| match slot {
            Some(h) if h.is_valid() => flag,
            _ => 0,
        };
        let [er, eg, eb] = self.emissive;
        MaterialParams {
            base_color_factor: self.base_color,
            emissive_factor: [er, eg, eb, 0.0],
            metallic_factor: self.metallic,
            roughness_factor: self.roughness,
            ao_factor: self.ao,
            flags: bound(self.albedo, MaterialParams::HAS_ALBEDO)
                | bound(self.normal, MaterialParams::HAS_NORMAL)
                | bound(self.metallic_roughness, MaterialParams::HAS_METALLIC_ROUGHNESS)
                | bound(self.occlusion, MaterialParams::HAS_OCCLUSION),
        }
    }
}

// ---------- Path cache ----------

/// path -> every (options hash, handle) loaded from it, in load order.
struct PathCache<T> {
    entries: HashMap<PathBuf, Vec<(u64, Handle<T>)>>,
}

impl<T> Default for PathCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> PathCache<T> {
    fn lookup(&self, path: &Path, key: u64) -> Option<Handle<T>> {
        self.entries
            .get(path)?
            .iter()
            .find(|(k, _)| *k == key)
            .map(|&(_, h)| h)
    }

    fn first(&self, path: &Path) -> Option<Handle<T>> {
        self.entries.get(path)?.first().map(|&(_, h)| h)
    }

    fn insert(&mut self, path: &Path, key: u64, handle: Handle<T>) {
        let list = self.entries.entry(path.to_path_buf()).or_default();
        match list.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = handle,
            None => list.push((key, handle)),
        }
    }

    fn retain_live(&mut self, pool: &ResourcePool<T>) {
        self.entries.retain(|_, list| {
            list.retain(|&(_, h)| pool.is_valid(h));
            !list.is_empty()
        });
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------- Stats ----------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub texture_count: usize,
    pub model_count: usize,
    pub material_count: usize,
    pub texture_memory: u64,
    pub model_memory: u64,
    pub material_memory: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ResourceStats {
    pub fn total_memory(&self) -> u64 {
        self.texture_memory + self.model_memory + self.material_memory
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for ResourceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Textures:  {} ({})",
            self.texture_count,
            format_bytes(self.texture_memory)
        )?;
        writeln!(
            f,
            "Models:    {} ({})",
            self.model_count,
            format_bytes(self.model_memory)
        )?;
        writeln!(
            f,
            "Materials: {} ({})",
            self.material_count,
            format_bytes(self.material_memory)
        )?;
        writeln!(f, "Total:     {}", format_bytes(self.total_memory()))?;
        write!(
            f,
            "Cache:     {} hits / {} misses ({:.1}%)",
            self.cache_hits,
            self.cache_misses,
            self.hit_rate() * 100.0
        )
    }
}

// ---------- Kind-generic access ----------

/// Resource types stored by [`ResourceManager`]; lets `get`, `retain` and
/// `release` take any handle kind.
pub trait PooledResource<B: GpuBackend>: Sized + 'static {
    fn pool(manager: &ResourceManager<B>) -> &ResourcePool<Self>;
    fn pool_mut(manager: &mut ResourceManager<B>) -> &mut ResourcePool<Self>;
}

impl<B: GpuBackend> PooledResource<B> for Texture<B> {
    fn pool(manager: &ResourceManager<B>) -> &ResourcePool<Self> {
        &manager.textures
    }
    fn pool_mut(manager: &mut ResourceManager<B>) -> &mut ResourcePool<Self> {
        &mut manager.textures
    }
}

impl<B: GpuBackend> PooledResource<B> for Model<B> {
    fn pool(manager: &ResourceManager<B>) -> &ResourcePool<Self> {
        &manager.models
    }
    fn pool_mut(manager: &mut ResourceManager<B>) -> &mut ResourcePool<Self> {
        &mut manager.models
    }
}

impl<B: GpuBackend> PooledResource<B> for Material<B> {
    fn pool(manager: &ResourceManager<B>) -> &ResourcePool<Self> {
        &manager.materials
    }
    fn pool_mut(manager: &mut ResourceManager<B>) -> &mut ResourcePool<Self> {
        &mut manager.materials
    }
}

// ---------- ResourceManager ----------

pub struct ResourceManager<B: GpuBackend> {
    backend: B,
    decoder: Arc<dyn AssetDecoder>,
    config: ResourceConfig,
    initialized: bool,

    textures: ResourcePool<Texture<B>>,
    models: ResourcePool<Model<B>>,
    materials: ResourcePool<Material<B>>,

    texture_cache: PathCache<Texture<B>>,
    model_cache: PathCache<Model<B>>,
    material_names: HashMap<String, MaterialHandle<B>>,

    cache_hits: u64,
    cache_misses: u64,
}

impl<B: GpuBackend> ResourceManager<B> {
    /// Decodes from the filesystem with [`FileDecoder`].
    pub fn new(backend: B, config: ResourceConfig) -> Self {
        Self::with_decoder(backend, Arc::new(FileDecoder), config)
    }

    pub fn with_decoder(backend: B, decoder: Arc<dyn AssetDecoder>, config: ResourceConfig) -> Self {
        let capacity = config.initial_capacity;
        let mut manager = Self {
            backend,
            decoder,
            initialized: false,
            textures: ResourcePool::with_capacity(capacity),
            models: ResourcePool::with_capacity(capacity),
            materials: ResourcePool::with_capacity(capacity),
            texture_cache: PathCache::default(),
            model_cache: PathCache::default(),
            material_names: HashMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            config,
        };
        if manager.config.auto_initialize {
            manager.initialize();
        }
        manager
    }

    // ---------- Lifecycle ----------

    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        info!("Resource manager initialized");
    }

    /// Drops every resource. The manager can be initialized again afterwards.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.clear();
        self.initialized = false;
        info!("Resource manager shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn decoder(&self) -> &Arc<dyn AssetDecoder> {
        &self.decoder
    }

    // ---------- Textures ----------

    /// Returns the cached handle (with its ref count bumped) or decodes, uploads
    /// and caches the file.
    pub fn load_texture(&mut self, path: impl AsRef<Path>, desc: &TextureDesc) -> Result<TextureHandle<B>> {
        let path = path.as_ref();
        self.ensure_initialized()?;
        if let Some(handle) = self.cached_texture(path, desc) {
            return Ok(handle);
        }
        self.cache_misses += 1;

        let data = self
            .decoder
            .decode_texture(path, desc, &|_| {})
            .map_err(|e| Error::decode(path, e))?;
        self.insert_texture(path, desc, data)
    }

    /// Same cache protocol as [`load_texture`](Self::load_texture) for a payload
    /// decoded elsewhere. A cache hit drops `data`.
    pub fn upload_texture_data(
        &mut self,
        path: impl AsRef<Path>,
        desc: &TextureDesc,
        data: TextureData,
    ) -> Result<TextureHandle<B>> {
        let path = path.as_ref();
        self.ensure_initialized()?;
        if let Some(handle) = self.cached_texture(path, desc) {
            return Ok(handle);
        }
        self.cache_misses += 1;
        self.insert_texture(path, desc, data)
    }

    /// Handle for the first options `path` was loaded with, or the invalid handle.
    pub fn get_texture(&self, path: impl AsRef<Path>) -> TextureHandle<B> {
        self.texture_cache
            .first(path.as_ref())
            .unwrap_or_default()
    }

    pub fn get_texture_with(&self, path: impl AsRef<Path>, desc: &TextureDesc) -> TextureHandle<B> {
        self.texture_cache
            .lookup(path.as_ref(), desc.cache_key())
            .unwrap_or_default()
    }

    fn cached_texture(&mut self, path: &Path, desc: &TextureDesc) -> Option<TextureHandle<B>> {
        let handle = self.texture_cache.lookup(path, desc.cache_key())?;
        let refs = self.textures.add_ref(handle);
        if refs == 0 {
            warn!("Stale texture cache entry for {}", path.display());
            return None;
        }
        self.cache_hits += 1;
        debug!("Texture cache hit: {} {:?} (refs {})", path.display(), handle, refs);
        Some(handle)
    }

    fn insert_texture(&mut self, path: &Path, desc: &TextureDesc, data: TextureData) -> Result<TextureHandle<B>> {
        let label = path.display().to_string();
        let gpu = self
            .backend
            .upload_texture(&label, &data)
            .map_err(|e| Error::upload(&label, e))?;

        let texture = Texture {
            path: path.to_path_buf(),
            width: data.width,
            height: data.height,
            mip_levels: data.mip_level_count(),
            format: data.format,
            size_bytes: data.size_bytes(),
            gpu,
        };
        info!(
            "Loaded texture {} ({}x{}, {} mips, {})",
            label,
            texture.width,
            texture.height,
            texture.mip_levels,
            format_bytes(texture.size_bytes)
        );

        let handle = self.textures.add(texture);
        self.texture_cache.insert(path, desc.cache_key(), handle);
        Ok(handle)
    }

    // ---------- Models ----------

    pub fn load_model(&mut self, path: impl AsRef<Path>, desc: &ModelDesc) -> Result<ModelHandle<B>> {
        let path = path.as_ref();
        self.ensure_initialized()?;
        if let Some(handle) = self.cached_model(path, desc) {
            return Ok(handle);
        }
        self.cache_misses += 1;

        let data = self
            .decoder
            .decode_model(path, desc, &|_| {})
            .map_err(|e| Error::decode(path, e))?;
        self.insert_model(path, desc, data)
    }

    pub fn upload_model_data(
        &mut self,
        path: impl AsRef<Path>,
        desc: &ModelDesc,
        data: ModelData,
    ) -> Result<ModelHandle<B>> {
        let path = path.as_ref();
        self.ensure_initialized()?;
        if let Some(handle) = self.cached_model(path, desc) {
            return Ok(handle);
        }
        self.cache_misses += 1;
        self.insert_model(path, desc, data)
    }

    pub fn get_model(&self, path: impl AsRef<Path>) -> ModelHandle<B> {
        self.model_cache.first(path.as_ref()).unwrap_or_default()
    }

    pub fn get_model_with(&self, path: impl AsRef<Path>, desc: &ModelDesc) -> ModelHandle<B> {
        self.model_cache
            .lookup(path.as_ref(), desc.cache_key())
            .unwrap_or_default()
    }

    fn cached_model(&mut self, path: &Path, desc: &ModelDesc) -> Option<ModelHandle<B>> {
        let handle = self.model_cache.lookup(path, desc.cache_key())?;
        let refs = self.models.add_ref(handle);
        if refs == 0 {
            warn!("Stale model cache entry for {}", path.display());
            return None;
        }
        self.cache_hits += 1;
        debug!("Model cache hit: {} {:?} (refs {})", path.display(), handle, refs);
        Some(handle)
    }

    fn insert_model(&mut self, path: &Path, desc: &ModelDesc, data: ModelData) -> Result<ModelHandle<B>> {
        let size_bytes = data.size_bytes();
        let aabb = data.aabb();

        let mut meshes = Vec::with_capacity(data.meshes.len());
        for mesh in &data.meshes {
            let label = format!("{}#{}", path.display(), mesh.name);
            let gpu = self
                .backend
                .upload_mesh(&label, mesh)
                .map_err(|e| Error::upload(&label, e))?;
            meshes.push(Mesh {
                name: mesh.name.clone(),
                vertex_count: mesh.vertices.len() as u32,
                index_count: mesh.indices.len() as u32,
                material_index: mesh.material_index,
                aabb: mesh.aabb,
                gpu,
            });
        }
        info!(
            "Loaded model {} ({} meshes, {} vertices, {})",
            path.display(),
            meshes.len(),
            data.vertex_count(),
            format_bytes(size_bytes)
        );

        let handle = self.models.add(Model {
            path: path.to_path_buf(),
            meshes,
            aabb,
            size_bytes,
        });
        self.model_cache.insert(path, desc.cache_key(), handle);
        Ok(handle)
    }

    // ---------- Materials ----------

    /// Always creates a new material. A later material with the same name takes
    /// over the name lookup; the earlier one stays alive until released.
    pub fn create_material(&mut self, name: &str, desc: &MaterialDesc<B>) -> Result<MaterialHandle<B>> {
        self.ensure_initialized()?;
        let params = desc.params();
        let gpu = self
            .backend
            .create_material(name, &params)
            .map_err(|e| Error::upload(name, e))?;

        let handle = self.materials.add(Material {
            name: name.to_owned(),
            params,
            albedo: desc.albedo,
            normal: desc.normal,
            metallic_roughness: desc.metallic_roughness,
            occlusion: desc.occlusion,
            gpu,
        });
        if let Some(previous) = self.material_names.insert(name.to_owned(), handle) {
            debug!("Material '{name}' now names {handle:?} (was {previous:?})");
        }
        Ok(handle)
    }

    pub fn get_material(&self, name: &str) -> MaterialHandle<B> {
        self.material_names.get(name).copied().unwrap_or_default()
    }

    // ---------- Any kind ----------

    pub fn get<R: PooledResource<B>>(&self, handle: Handle<R>) -> Option<Arc<R>> {
        R::pool(self).get(handle)
    }

    pub fn is_live<R: PooledResource<B>>(&self, handle: Handle<R>) -> bool {
        R::pool(self).is_valid(handle)
    }

    /// Adds a reference. Returns the new count, 0 for a stale handle.
    pub fn retain<R: PooledResource<B>>(&mut self, handle: Handle<R>) -> u32 {
        R::pool_mut(self).add_ref(handle)
    }

    /// Drops a reference. The resource stays alive until `release_unused`.
    pub fn release<R: PooledResource<B>>(&mut self, handle: Handle<R>) -> u32 {
        if !self.is_live(handle) {
            debug!("release on stale handle {handle:?}");
            return 0;
        }
        R::pool_mut(self).release(handle)
    }

    pub fn ref_count<R: PooledResource<B>>(&self, handle: Handle<R>) -> Option<u32> {
        R::pool(self).ref_count(handle)
    }

    /// Frees every resource with no references left and forgets its cache entries.
    pub fn release_unused(&mut self) -> usize {
        let freed = self.textures.release_unused()
            + self.models.release_unused()
            + self.materials.release_unused();

        self.texture_cache.retain_live(&self.textures);
        self.model_cache.retain_live(&self.models);
        let materials = &self.materials;
        self.material_names.retain(|_, h| materials.is_valid(*h));

        if freed > 0 {
            info!("Released {freed} unused resources");
        }
        freed
    }

    pub fn clear(&mut self) {
        self.textures.clear();
        self.models.clear();
        self.materials.clear();
        self.texture_cache.clear();
        self.model_cache.clear();
        self.material_names.clear();
        debug!("Resource manager cleared");
    }

    // ---------- Stats ----------

    pub fn stats(&self) -> ResourceStats {
        let mut stats = ResourceStats {
            texture_count: self.textures.len(),
            model_count: self.models.len(),
            material_count: self.materials.len(),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            ..ResourceStats::default()
        };
        self.textures
            .for_each(|_, t| stats.texture_memory += t.size_bytes);
        self.models.for_each(|_, m| stats.model_memory += m.size_bytes);
        stats.material_memory =
            (self.materials.len() * std::mem::size_of::<MaterialParams>()) as u64;
        stats
    }

    pub fn reset_stats(&mut self) {
        self.cache_hits = 0;
        self.cache_misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::backend::HeadlessBackend;
    use crate::test_support::{texture_payload, triangle_model, StubDecoder};

    fn manager() -> (ResourceManager<HeadlessBackend>, Arc<StubDecoder>) {
        let decoder = Arc::new(StubDecoder::new());
        let manager =
            ResourceManager::with_decoder(HeadlessBackend::new(), decoder.clone(), ResourceConfig::default());
        (manager, decoder)
    }

    #[test]
    fn test_second_load_is_a_cache_hit() {
        let (mut rm, decoder) = manager();
        let desc = TextureDesc::default();

        let a = rm.load_texture("brick.png", &desc).unwrap();
        let b = rm.load_texture("brick.png", &desc).unwrap();

        assert_eq!(a, b);
        assert_eq!(decoder.texture_calls(), 1);
        assert_eq!(rm.ref_count(a), Some(2));
        let stats = rm.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
        assert_eq!(stats.texture_count, 1);
        assert_eq!(stats.texture_memory, 16);
        assert_eq!(rm.backend().textures_uploaded, 1);
    }

    #[test]
    fn test_options_are_part_of_the_cache_key() {
        let (mut rm, decoder) = manager();
        let srgb = rm.load_texture("albedo.png", &TextureDesc::default()).unwrap();
        let linear = rm.load_texture("albedo.png", &TextureDesc::linear()).unwrap();

        assert_ne!(srgb, linear);
        assert_eq!(decoder.texture_calls(), 2);
        assert_eq!(rm.get_texture("albedo.png"), srgb);
        assert_eq!(rm.get_texture_with("albedo.png", &TextureDesc::linear()), linear);
        assert_eq!(
            rm.get(linear).unwrap().format,
            TextureFormat::Rgba8Unorm
        );
    }

    #[test]
    fn test_get_on_miss_is_invalid() {
        let (rm, _) = manager();
        assert!(!rm.get_texture("nope.png").is_valid());
        assert!(!rm.get_model("nope.glb").is_valid());
        assert!(!rm.get_material("nope").is_valid());
    }

    #[test]
    fn test_decode_failure_inserts_nothing() {
        let (mut rm, decoder) = manager();
        decoder.fail_on("broken.png");

        let err = rm.load_texture("broken.png", &TextureDesc::default()).unwrap_err();
        assert!(err.is_decode());
        assert_eq!(rm.stats().texture_count, 0);
        assert!(!rm.get_texture("broken.png").is_valid());
    }

    #[test]
    fn test_upload_failure_inserts_nothing() {
        let decoder = Arc::new(StubDecoder::new());
        let mut rm = ResourceManager::with_decoder(
            HeadlessBackend::with_max_texture_dimension(1),
            decoder,
            ResourceConfig::default(),
        );

        let err = rm.load_texture("big.png", &TextureDesc::default()).unwrap_err();
        assert!(err.is_upload());
        assert!(err.to_string().contains("big.png"));
        assert_eq!(rm.stats().texture_count, 0);
    }

    #[test]
    fn test_release_defers_freeing() {
        let (mut rm, _) = manager();
        let desc = TextureDesc::default();
        let tex = rm.load_texture("a.png", &desc).unwrap();
        rm.load_texture("a.png", &desc).unwrap();

        assert_eq!(rm.release(tex), 1);
        assert_eq!(rm.release_unused(), 0);
        assert_eq!(rm.release(tex), 0);
        assert!(rm.is_live(tex));

        assert_eq!(rm.release_unused(), 1);
        assert!(!rm.is_live(tex));
        assert!(rm.get(tex).is_none());
        assert!(!rm.get_texture("a.png").is_valid());
        assert_eq!(rm.release_unused(), 0);
        assert_eq!(rm.release(tex), 0);
    }

    #[test]
    fn test_outstanding_arc_survives_release() {
        let (mut rm, _) = manager();
        let tex = rm.load_texture("a.png", &TextureDesc::default()).unwrap();
        let owned = rm.get(tex).unwrap();

        rm.release(tex);
        rm.release_unused();

        assert!(!rm.is_live(tex));
        assert_eq!(owned.path, PathBuf::from("a.png"));
        assert_eq!((owned.width, owned.height), (2, 2));
    }

    #[test]
    fn test_reload_after_release_gets_new_generation() {
        let (mut rm, decoder) = manager();
        let desc = TextureDesc::default();
        let first = rm.load_texture("a.png", &desc).unwrap();
        rm.release(first);
        rm.release_unused();

        let second = rm.load_texture("a.png", &desc).unwrap();
        assert_eq!(second.index(), first.index());
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(!rm.is_live(first));
        assert_eq!(decoder.texture_calls(), 2);
    }

    #[test]
    fn test_models_and_upload_data() {
        let (mut rm, decoder) = manager();
        let desc = ModelDesc::default();

        let model = rm.upload_model_data("tri.glb", &desc, triangle_model()).unwrap();
        let again = rm.load_model("tri.glb", &desc).unwrap();
        assert_eq!(model, again);
        assert_eq!(decoder.model_calls(), 0);

        let m = rm.get(model).unwrap();
        assert_eq!(m.meshes.len(), 1);
        assert_eq!(m.meshes[0].index_count, 3);
        assert_eq!(m.aabb.unwrap().max, [1.0, 1.0, 0.0]);
        assert_eq!(rm.stats().model_memory, 3 * 48 + 3 * 4);
        assert_eq!(rm.backend().meshes_uploaded, 1);
    }

    #[test]
    fn test_upload_texture_data_hit_drops_payload() {
        let (mut rm, _) = manager();
        let desc = TextureDesc::default();
        let tex = rm.load_texture("a.png", &desc).unwrap();
        let same = rm
            .upload_texture_data("a.png", &desc, texture_payload(4, 4, &desc))
            .unwrap();
        assert_eq!(tex, same);
        assert_eq!(rm.get(tex).unwrap().width, 2);
        assert_eq!(rm.backend().textures_uploaded, 1);
    }

    #[test]
    fn test_materials() {
        let (mut rm, _) = manager();
        let albedo = rm.load_texture("albedo.png", &TextureDesc::default()).unwrap();
        let desc = MaterialDesc {
            albedo: Some(albedo),
            normal: Some(Handle::invalid()),
            metallic: 1.0,
            ..MaterialDesc::default()
        };

        let first = rm.create_material("gold", &desc).unwrap();
        let second = rm.create_material("gold", &desc).unwrap();
        assert_ne!(first, second);
        assert_eq!(rm.get_material("gold"), second);
        assert!(rm.is_live(first));

        let mat = rm.get(second).unwrap();
        assert_eq!(mat.params.flags, MaterialParams::HAS_ALBEDO);
        assert_eq!(mat.params.metallic_factor, 1.0);
        assert_eq!(mat.albedo, Some(albedo));
        assert_eq!(rm.stats().material_memory, 96);

        rm.release(second);
        rm.release_unused();
        assert!(!rm.get_material("gold").is_valid());
        assert!(rm.is_live(first));
    }

    #[test]
    fn test_lifecycle() {
        let decoder = Arc::new(StubDecoder::new());
        let config = ResourceConfig {
            auto_initialize: false,
            ..ResourceConfig::default()
        };
        let mut rm = ResourceManager::with_decoder(HeadlessBackend::new(), decoder, config);

        assert!(!rm.is_initialized());
        let err = rm.load_texture("a.png", &TextureDesc::default()).unwrap_err();
        assert!(matches!(err, Error::NotInitialized));

        rm.initialize();
        rm.initialize();
        let tex = rm.load_texture("a.png", &TextureDesc::default()).unwrap();

        rm.shutdown();
        rm.shutdown();
        assert!(!rm.is_initialized());
        assert!(!rm.is_live(tex));
        assert_eq!(rm.stats().texture_count, 0);
        assert!(rm
            .create_material("m", &MaterialDesc::default())
            .unwrap_err()
            .to_string()
            .contains("not initialized"));
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let (mut rm, _) = manager();
        let tex = rm.load_texture("a.png", &TextureDesc::default()).unwrap();
        let model = rm.load_model("m.glb", &ModelDesc::default()).unwrap();
        rm.clear();
        assert!(!rm.is_live(tex));
        assert!(!rm.is_live(model));
        assert!(!rm.get_model("m.glb").is_valid());
    }

    #[test]
    fn test_handles_from_before_shutdown_stay_stale() {
        let (mut rm, _) = manager();
        let desc = TextureDesc::default();
        let brick = rm.load_texture("brick.png", &desc).unwrap();

        rm.shutdown();
        rm.initialize();
        let grass = rm.load_texture("grass.png", &desc).unwrap();

        assert_eq!(grass.index(), brick.index());
        assert!(!rm.is_live(brick));
        assert!(rm.get(brick).is_none());
        assert_eq!(rm.retain(brick), 0);
        assert_eq!(rm.get(grass).unwrap().path, PathBuf::from("grass.png"));
    }

    #[test]
    fn test_handles_from_before_clear_stay_stale() {
        let (mut rm, _) = manager();
        let old = rm.create_material("old", &MaterialDesc::default()).unwrap();
        rm.clear();
        let new = rm.create_material("new", &MaterialDesc::default()).unwrap();

        assert!(!rm.is_live(old));
        assert!(rm.is_live(new));
        assert_ne!(old, new);
    }

    #[test]
    fn test_stats_display_and_reset() {
        let (mut rm, _) = manager();
        rm.load_texture("a.png", &TextureDesc::default()).unwrap();
        rm.load_texture("a.png", &TextureDesc::default()).unwrap();

        let text = rm.stats().to_string();
        assert!(text.contains("Textures:  1 (16 B)"));
        assert!(text.contains("1 hits / 1 misses (50.0%)"));

        rm.reset_stats();
        assert_eq!(rm.stats().cache_hits, 0);
        assert_eq!(rm.stats().hit_rate(), 0.0);
    }

    #[test]
    fn test_config_from_json() {
        let config = ResourceConfig::from_json_str(r#"{"auto_initialize": false}"#).unwrap();
        assert!(!config.auto_initialize);
        assert_eq!(config.initial_capacity, 64);
        assert!(config.texture_defaults.generate_mipmaps);

        let err = ResourceConfig::from_json_str("{").unwrap_err();
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
