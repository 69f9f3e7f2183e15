// src/test_support.rs
// Fixtures shared by the unit tests: temp paths, an in-memory GLB and a
// scripted decoder.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::asset::AssetDecoder;
use crate::gltf_loader::{Aabb, MeshData, ModelData, ModelDesc, Vertex};
use crate::texture_importer::{ImportError, TextureData, TextureDesc};

/// Unique per process so parallel test binaries do not collide.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("slop_resources_{}_{}", std::process::id(), name))
}

/// One triangle in the XY plane with UVs, no normals, no indices, no material.
pub fn triangle_glb() -> Vec<u8> {
    let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let uvs: [[f32; 2]; 3] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];

    let mut bin = Vec::new();
    bin.extend_from_slice(bytemuck::cast_slice::<[f32; 3], u8>(&positions));
    bin.extend_from_slice(bytemuck::cast_slice::<[f32; 2], u8>(&uvs));
    assert_eq!(bin.len(), 60);

    let json = r#"{
        "asset": {"version": "2.0"},
        "buffers": [{"byteLength": 60}],
        "bufferViews": [
            {"buffer": 0, "byteOffset": 0, "byteLength": 36},
            {"buffer": 0, "byteOffset": 36, "byteLength": 24}
        ],
        "accessors": [
            {"bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
             "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]},
            {"bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC2"}
        ],
        "meshes": [{"name": "triangle", "primitives": [{"attributes": {"POSITION": 0, "TEXCOORD_0": 1}}]}]
    }"#;
    let mut json = json.as_bytes().to_vec();
    while json.len() % 4 != 0 {
        json.push(b' ');
    }

    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut glb = Vec::with_capacity(total);
    glb.extend_from_slice(&0x4654_6C67u32.to_le_bytes()); // "glTF"
    glb.extend_from_slice(&2u32.to_le_bytes());
    glb.extend_from_slice(&(total as u32).to_le_bytes());
    glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
    glb.extend_from_slice(&0x4E4F_534Au32.to_le_bytes()); // "JSON"
    glb.extend_from_slice(&json);
    glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    glb.extend_from_slice(&0x004E_4942u32.to_le_bytes()); // "BIN\0"
    glb.extend_from_slice(&bin);
    glb
}

pub fn texture_payload(width: u32, height: u32, desc: &TextureDesc) -> TextureData {
    let pixels = vec![255; (width * height * 4) as usize];
    TextureData::from_rgba8(width, height, pixels, desc.format()).unwrap()
}

pub fn triangle_model() -> ModelData {
    let vertices = vec![
        Vertex { position: [0.0, 0.0, 0.0], ..Default::default() },
        Vertex { position: [1.0, 0.0, 0.0], ..Default::default() },
        Vertex { position: [0.0, 1.0, 0.0], ..Default::default() },
    ];
    let aabb = Aabb::from_vertices(&vertices).unwrap();
    ModelData {
        meshes: vec![MeshData {
            name: "triangle/0".into(),
            vertices,
            indices: vec![0, 1, 2],
            material_index: None,
            aabb,
        }],
    }
}

// ---------- scripted decoder ----------

#[derive(Default)]
struct GateState {
    open: bool,
    blocked: usize,
}

/// Decoder that never touches the disk.
///
/// - Textures decode to 2x2 RGBA, models to one triangle.
/// - Paths registered with `fail_on` return `ImportError::InvalidData`.
/// - Paths registered with `panic_on` panic inside the decoder.
/// - Paths containing `"block"` park inside the decoder until `open_gate`.
#[derive(Default)]
pub struct StubDecoder {
    texture_calls: AtomicUsize,
    model_calls: AtomicUsize,
    failing: Mutex<HashSet<PathBuf>>,
    panicking: Mutex<HashSet<PathBuf>>,
    gate: Mutex<GateState>,
    gate_changed: Condvar,
}

impl StubDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing.lock().insert(path.into());
    }

    pub fn panic_on(&self, path: impl Into<PathBuf>) {
        self.panicking.lock().insert(path.into());
    }

    pub fn texture_calls(&self) -> usize {
        self.texture_calls.load(Ordering::SeqCst)
    }

    pub fn model_calls(&self) -> usize {
        self.model_calls.load(Ordering::SeqCst)
    }

    /// Blocks until `count` decodes are parked at the gate. Panics after 5s.
    pub fn wait_until_blocked(&self, count: usize) {
        let mut gate = self.gate.lock();
        while gate.blocked < count {
            if self
                .gate_changed
                .wait_for(&mut gate, Duration::from_secs(5))
                .timed_out()
            {
                panic!("only {} of {count} decodes reached the gate", gate.blocked);
            }
        }
    }

    pub fn open_gate(&self) {
        self.gate.lock().open = true;
        self.gate_changed.notify_all();
    }

    fn script(&self, path: &Path) -> Result<(), ImportError> {
        if path.to_string_lossy().contains("block") {
            let mut gate = self.gate.lock();
            gate.blocked += 1;
            self.gate_changed.notify_all();
            while !gate.open {
                self.gate_changed.wait(&mut gate);
            }
            gate.blocked -= 1;
        }
        if self.panicking.lock().contains(path) {
            panic!("scripted decoder panic for {}", path.display());
        }
        if self.failing.lock().contains(path) {
            return Err(ImportError::InvalidData(format!(
                "scripted failure for {}",
                path.display()
            )));
        }
        Ok(())
    }
}

impl AssetDecoder for StubDecoder {
    fn decode_texture(
        &self,
        path: &Path,
        desc: &TextureDesc,
        progress: &dyn Fn(f32),
    ) -> Result<TextureData, ImportError> {
        self.texture_calls.fetch_add(1, Ordering::SeqCst);
        progress(0.5);
        self.script(path)?;
        progress(1.0);
        Ok(texture_payload(2, 2, desc))
    }

    fn decode_model(
        &self,
        path: &Path,
        _desc: &ModelDesc,
        progress: &dyn Fn(f32),
    ) -> Result<ModelData, ImportError> {
        self.model_calls.fetch_add(1, Ordering::SeqCst);
        progress(0.5);
        self.script(path)?;
        progress(1.0);
        Ok(triangle_model())
    }
}
