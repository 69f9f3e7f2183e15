//! Graphics-context collaborator.
//!
//! Everything here creates GPU objects and is therefore only legal on the thread
//! that owns the device/queue. The resource manager calls it from `&mut self`
//! methods; the async loader only calls it from `process_completed_loads`.

use std::sync::Arc;

use anyhow::{ensure, Result};
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::gltf_loader::{MeshData, Vertex};
use crate::texture_importer::{TextureData, TextureFormat};

/// Uniform block handed to the backend for every material. 48 bytes, 16-aligned.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialParams {
    pub base_color_factor: [f32; 4],
    /// rgb = emissive, a unused.
    pub emissive_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub ao_factor: f32,
    /// Bitmask of `MaterialParams::HAS_*`.
    pub flags: u32,
}

impl MaterialParams {
    pub const HAS_ALBEDO: u32 = 1 << 0;
    pub const HAS_NORMAL: u32 = 1 << 1;
    pub const HAS_METALLIC_ROUGHNESS: u32 = 1 << 2;
    pub const HAS_OCCLUSION: u32 = 1 << 3;
}

/// Creates GPU objects from decoded CPU payloads.
pub trait GpuBackend: 'static {
    type Texture: 'static;
    type Mesh: 'static;
    type Material: 'static;

    fn upload_texture(&mut self, label: &str, data: &TextureData) -> Result<Self::Texture>;

    fn upload_mesh(&mut self, label: &str, mesh: &MeshData) -> Result<Self::Mesh>;

    fn create_material(&mut self, label: &str, params: &MaterialParams) -> Result<Self::Material>;
}

// ---------- wgpu ----------

pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
}

pub struct GpuMesh {
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
}

pub struct GpuMaterial {
    pub params_buffer: wgpu::Buffer,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
    }
}

impl GpuBackend for WgpuBackend {
    type Texture = GpuTexture;
    type Mesh = GpuMesh;
    type Material = GpuMaterial;

    fn upload_texture(&mut self, label: &str, data: &TextureData) -> Result<GpuTexture> {
        let max = self.device.limits().max_texture_dimension_2d;
        ensure!(
            data.width <= max && data.height <= max,
            "{}x{} exceeds the device limit of {max}",
            data.width,
            data.height
        );
        ensure!(!data.mips.is_empty(), "texture has no mip levels");

        let size = wgpu::Extent3d {
            width: data.width,
            height: data.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: data.mip_level_count(),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(data.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let bpp = data.format.bytes_per_pixel();
        for (level, mip) in data.mips.iter().enumerate() {
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &mip.pixels,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bpp * mip.width),
                    rows_per_image: Some(mip.height),
                },
                wgpu::Extent3d {
                    width: mip.width,
                    height: mip.height,
                    depth_or_array_layers: 1,
                },
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mipmap_filter = if data.mips.len() > 1 {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(label),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter,
            ..Default::default()
        });

        Ok(GpuTexture {
            texture,
            view,
            sampler,
        })
    }

    fn upload_mesh(&mut self, label: &str, mesh: &MeshData) -> Result<GpuMesh> {
        ensure!(!mesh.vertices.is_empty(), "mesh has no vertices");
        ensure!(!mesh.indices.is_empty(), "mesh has no indices");

        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice::<Vertex, u8>(&mesh.vertices),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice::<u32, u8>(&mesh.indices),
                usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            });

        Ok(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
        })
    }

    fn create_material(&mut self, label: &str, params: &MaterialParams) -> Result<GpuMaterial> {
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        Ok(GpuMaterial { params_buffer })
    }
}

// ---------- headless ----------

/// CPU-only backend for tools, servers and tests. Creates nothing, counts calls,
/// and enforces a texture size limit like a real device would.
#[derive(Debug, Clone)]
pub struct HeadlessBackend {
    pub max_texture_dimension: u32,
    pub textures_uploaded: usize,
    pub meshes_uploaded: usize,
    pub materials_created: usize,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self {
            max_texture_dimension: 8192,
            textures_uploaded: 0,
            meshes_uploaded: 0,
            materials_created: 0,
        }
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_texture_dimension(max_texture_dimension: u32) -> Self {
        Self {
            max_texture_dimension,
            ..Self::default()
        }
    }
}

impl GpuBackend for HeadlessBackend {
    type Texture = ();
    type Mesh = ();
    type Material = ();

    fn upload_texture(&mut self, _label: &str, data: &TextureData) -> Result<()> {
        let max = self.max_texture_dimension;
        ensure!(
            data.width <= max && data.height <= max,
            "{}x{} exceeds the device limit of {max}",
            data.width,
            data.height
        );
        self.textures_uploaded += 1;
        Ok(())
    }

    fn upload_mesh(&mut self, _label: &str, mesh: &MeshData) -> Result<()> {
        ensure!(
            !mesh.vertices.is_empty() && !mesh.indices.is_empty(),
            "mesh has no geometry"
        );
        self.meshes_uploaded += 1;
        Ok(())
    }

    fn create_material(&mut self, _label: &str, _params: &MaterialParams) -> Result<()> {
        self.materials_created += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_params_is_a_48_byte_uniform_block() {
        assert_eq!(std::mem::size_of::<MaterialParams>(), 48);
        assert_eq!(std::mem::size_of::<MaterialParams>() % 16, 0);
    }

    #[test]
    fn headless_enforces_texture_limit() {
        let mut backend = HeadlessBackend::with_max_texture_dimension(2);
        let small = TextureData::from_rgba8(2, 2, vec![0; 16], TextureFormat::Rgba8Unorm).unwrap();
        let large = TextureData::from_rgba8(4, 1, vec![0; 16], TextureFormat::Rgba8Unorm).unwrap();

        assert!(backend.upload_texture("small", &small).is_ok());
        let err = backend.upload_texture("large", &large).unwrap_err();
        assert!(err.to_string().contains("exceeds the device limit"));
        assert_eq!(backend.textures_uploaded, 1);
    }
}
