// src/gltf_loader.rs
// CPU-side glTF loader: meshes only, no GPU objects.
// Requires: gltf, glam, bytemuck

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::texture_importer::ImportError;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// xyz = tangent, w = bitangent sign.
    pub tangent: [f32; 4],
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn from_vertices(vertices: &[Vertex]) -> Option<Self> {
        let first = Vec3::from_array(vertices.first()?.position);
        let (min, max) = vertices.iter().fold((first, first), |(min, max), v| {
            let p = Vec3::from_array(v.position);
            (min.min(p), max.max(p))
        });
        Some(Self {
            min: min.to_array(),
            max: max.to_array(),
        })
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: Vec3::from_array(self.min).min(Vec3::from_array(other.min)).to_array(),
            max: Vec3::from_array(self.max).max(Vec3::from_array(other.max)).to_array(),
        }
    }
}

/// Options controlling how a model is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDesc {
    /// Generate smooth normals for primitives that have none.
    pub calculate_normals: bool,
    /// Generate tangents from UVs for primitives that have none.
    pub calculate_tangents: bool,
    /// Map `v` to `1 - v`.
    pub flip_v: bool,
}

impl Default for ModelDesc {
    fn default() -> Self {
        Self {
            calculate_normals: true,
            calculate_tangents: true,
            flip_v: false,
        }
    }
}

impl ModelDesc {
    pub fn cache_key(&self) -> u64 {
        xxh3_64(&[
            b'M',
            self.calculate_normals as u8,
            self.calculate_tangents as u8,
            self.flip_v as u8,
        ])
    }
}

/// One triangle primitive.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Index into the source file's material list.
    pub material_index: Option<usize>,
    pub aabb: Aabb,
}

impl MeshData {
    pub fn size_bytes(&self) -> u64 {
        (self.vertices.len() * std::mem::size_of::<Vertex>()
            + self.indices.len() * std::mem::size_of::<u32>()) as u64
    }
}

#[derive(Debug, Clone)]
pub struct ModelData {
    pub meshes: Vec<MeshData>,
}

impl ModelData {
    pub fn size_bytes(&self) -> u64 {
        self.meshes.iter().map(MeshData::size_bytes).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(|m| m.vertices.len()).sum()
    }

    pub fn aabb(&self) -> Option<Aabb> {
        self.meshes.iter().map(|m| m.aabb).reduce(Aabb::union)
    }
}

pub struct GltfLoader;

impl GltfLoader {
    /// Loads `.gltf` (external or embedded buffers) and `.glb` files.
    pub fn load_from_file(
        path: &Path,
        desc: &ModelDesc,
        progress: &dyn Fn(f32),
    ) -> Result<ModelData, ImportError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if extension != "gltf" && extension != "glb" {
            return Err(ImportError::Unsupported(format!(
                "unknown model extension: .{extension}"
            )));
        }

        let bytes = std::fs::read(path)?;
        progress(0.2);
        Self::load_from_slice(&bytes, path.parent(), desc, progress)
    }

    /// Parses glTF JSON or GLB bytes. `base` resolves relative buffer URIs.
    pub fn load_from_slice(
        bytes: &[u8],
        base: Option<&Path>,
        desc: &ModelDesc,
        progress: &dyn Fn(f32),
    ) -> Result<ModelData, ImportError> {
        let gltf = gltf::Gltf::from_slice(bytes)?;
        let document = gltf.document;
        let buffers = gltf::import_buffers(&document, base, gltf.blob)?;
        progress(0.4);

        let mesh_count = document.meshes().len().max(1);
        let mut meshes = Vec::new();
        for (mesh_index, mesh) in document.meshes().enumerate() {
            let mesh_name = mesh
                .name()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("mesh{mesh_index}"));

            for (prim_index, primitive) in mesh.primitives().enumerate() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    log::warn!(
                        "Skipping {mesh_name}/{prim_index}: {:?} primitives are not supported",
                        primitive.mode()
                    );
                    continue;
                }
                let name = format!("{mesh_name}/{prim_index}");
                meshes.push(read_primitive(name, &primitive, &buffers, desc)?);
            }
            progress(0.4 + 0.6 * (mesh_index + 1) as f32 / mesh_count as f32);
        }

        if meshes.is_empty() {
            return Err(ImportError::InvalidData(
                "model contains no triangle primitives".into(),
            ));
        }
        Ok(ModelData { meshes })
    }
}

fn read_primitive(
    name: String,
    primitive: &gltf::Primitive<'_>,
    buffers: &[gltf::buffer::Data],
    desc: &ModelDesc,
) -> Result<MeshData, ImportError> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or_else(|| ImportError::InvalidData(format!("{name} has no POSITION attribute")))?
        .collect();

    let mut vertices: Vec<Vertex> = positions
        .iter()
        .map(|&position| Vertex {
            position,
            ..Vertex::default()
        })
        .collect();

    let has_normals = match reader.read_normals() {
        Some(normals) => {
            vertices.iter_mut().zip(normals).for_each(|(v, n)| v.normal = n);
            true
        }
        None => false,
    };

    let has_uvs = match reader.read_tex_coords(0) {
        Some(uvs) => {
            vertices.iter_mut().zip(uvs.into_f32()).for_each(|(v, [u, t])| {
                v.uv = if desc.flip_v { [u, 1.0 - t] } else { [u, t] };
            });
            true
        }
        None => false,
    };

    let has_tangents = match reader.read_tangents() {
        Some(tangents) => {
            vertices.iter_mut().zip(tangents).for_each(|(v, t)| v.tangent = t);
            true
        }
        None => false,
    };

    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..vertices.len() as u32).collect(),
    };
    if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
        return Err(ImportError::InvalidData(format!(
            "{name}: index {bad} out of range for {} vertices",
            vertices.len()
        )));
    }

    if !has_normals && desc.calculate_normals {
        compute_normals(&mut vertices, &indices);
    }
    if !has_tangents && has_uvs && desc.calculate_tangents {
        compute_tangents(&mut vertices, &indices);
    }

    let aabb = Aabb::from_vertices(&vertices)
        .ok_or_else(|| ImportError::InvalidData(format!("{name} has no vertices")))?;

    Ok(MeshData {
        name,
        vertices,
        indices,
        material_index: primitive.material().index(),
        aabb,
    })
}

/// Smooth normals: area-weighted average of incident face normals.
pub fn compute_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let mut accum = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let p0 = Vec3::from_array(vertices[a].position);
        let p1 = Vec3::from_array(vertices[b].position);
        let p2 = Vec3::from_array(vertices[c].position);
        // Unnormalized cross product is proportional to triangle area.
        let face = (p1 - p0).cross(p2 - p0);
        accum[a] += face;
        accum[b] += face;
        accum[c] += face;
    }

    for (v, n) in vertices.iter_mut().zip(accum) {
        v.normal = n.normalize_or_zero().to_array();
    }
}

/// Per-vertex tangents from UV derivatives, Gram-Schmidt orthogonalized against
/// the normal. `w` stores the bitangent handedness.
pub fn compute_tangents(vertices: &mut [Vertex], indices: &[u32]) {
    let mut tangents = vec![Vec3::ZERO; vertices.len()];
    let mut bitangents = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let p0 = Vec3::from_array(vertices[a].position);
        let e1 = Vec3::from_array(vertices[b].position) - p0;
        let e2 = Vec3::from_array(vertices[c].position) - p0;

        let uv0 = Vec2::from_array(vertices[a].uv);
        let d1 = Vec2::from_array(vertices[b].uv) - uv0;
        let d2 = Vec2::from_array(vertices[c].uv) - uv0;

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() <= f32::EPSILON {
            continue;
        }
        let r = 1.0 / det;
        let t = (e1 * d2.y - e2 * d1.y) * r;
        let bt = (e2 * d1.x - e1 * d2.x) * r;

        for i in [a, b, c] {
            tangents[i] += t;
            bitangents[i] += bt;
        }
    }

    for ((v, t), bt) in vertices.iter_mut().zip(tangents).zip(bitangents) {
        let n = Vec3::from_array(v.normal);
        let mut tangent = (t - n * n.dot(t)).normalize_or_zero();
        if tangent == Vec3::ZERO {
            tangent = if n == Vec3::ZERO {
                Vec3::X
            } else {
                n.normalize().any_orthonormal_vector()
            };
        }
        let w = if n.cross(tangent).dot(bt) < 0.0 { -1.0 } else { 1.0 };
        v.tangent = [tangent.x, tangent.y, tangent.z, w];
    }
}
