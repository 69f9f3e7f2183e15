//! # Asset decoding seam
//!
//! The format decoders are pure functions `decode(path, options) -> payload`.
//! They run on worker threads and must never touch the graphics context; the
//! payloads they return are plain CPU memory.
//!
//! - [`AssetDecoder`] is the seam the manager and the async loader decode through.
//! - [`FileDecoder`] is the default, backed by `image` and `gltf`.
//! - [`ResourceKind`] and [`LoadStatus`] are shared by the loader's bookkeeping.

use std::fmt;
use std::path::Path;

use crate::gltf_loader::{GltfLoader, ModelData, ModelDesc};
use crate::texture_importer::{ImportError, TextureData, TextureDesc, TextureImporter};

// ============================================================================
// Resource kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Texture = 0,
    Model,
    Material,
}

impl ResourceKind {
    /// File-backed kinds only; materials are never loaded from a path.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" | "jpg" | "jpeg" => Some(ResourceKind::Texture),
            "gltf" | "glb" => Some(ResourceKind::Model),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        get_extension(path).and_then(|ext| Self::from_extension(&ext))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Texture => "Texture",
            ResourceKind::Model => "Model",
            ResourceKind::Material => "Material",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Load status
// ============================================================================

/// State of a tracked async load.
///
/// `Pending -> Loading -> Completed | Failed`. A finished request reports
/// `Completed` or `Failed` until the next drain delivers it, after which it is
/// no longer tracked and status queries return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Queued; a worker has not picked it up yet. Still cancellable.
    Pending,
    /// A worker is decoding it.
    Loading,
    Completed,
    Failed,
}

impl LoadStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, LoadStatus::Pending | LoadStatus::Loading)
    }

    pub fn is_done(&self) -> bool {
        !self.is_in_progress()
    }
}

// ============================================================================
// Decoder seam
// ============================================================================

/// CPU-side decoders invoked by [`ResourceManager`](crate::ResourceManager) and
/// the loader's worker threads.
///
/// `progress` receives values in `0.0..=1.0` and may be called any number of times.
pub trait AssetDecoder: Send + Sync + 'static {
    fn decode_texture(
        &self,
        path: &Path,
        desc: &TextureDesc,
        progress: &dyn Fn(f32),
    ) -> Result<TextureData, ImportError>;

    fn decode_model(
        &self,
        path: &Path,
        desc: &ModelDesc,
        progress: &dyn Fn(f32),
    ) -> Result<ModelData, ImportError>;
}

/// Reads from the filesystem: PNG/JPEG through `image`, glTF/GLB through `gltf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDecoder;

impl AssetDecoder for FileDecoder {
    fn decode_texture(
        &self,
        path: &Path,
        desc: &TextureDesc,
        progress: &dyn Fn(f32),
    ) -> Result<TextureData, ImportError> {
        TextureImporter::load_from_file(path, desc, progress)
    }

    fn decode_model(
        &self,
        path: &Path,
        desc: &ModelDesc,
        progress: &dyn Fn(f32),
    ) -> Result<ModelData, ImportError> {
        GltfLoader::load_from_file(path, desc, progress)
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Get the lowercase file extension from a path
pub fn get_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(ResourceKind::from_extension("PNG"), Some(ResourceKind::Texture));
        assert_eq!(ResourceKind::from_extension("jpeg"), Some(ResourceKind::Texture));
        assert_eq!(ResourceKind::from_extension("glb"), Some(ResourceKind::Model));
        assert_eq!(ResourceKind::from_extension("mat"), None);
        assert_eq!(
            ResourceKind::from_path(Path::new("assets/helmet.gltf")),
            Some(ResourceKind::Model)
        );
        assert_eq!(ResourceKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_status_progress() {
        assert!(LoadStatus::Pending.is_in_progress());
        assert!(LoadStatus::Loading.is_in_progress());
        assert!(LoadStatus::Completed.is_done());
        assert!(LoadStatus::Failed.is_done());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_file_decoder_routes_by_kind() {
        let decoder = FileDecoder;
        let err = decoder
            .decode_texture(Path::new("x.glb"), &TextureDesc::default(), &|_| {})
            .unwrap_err();
        assert!(matches!(err, ImportError::Unsupported(_)));
        let err = decoder
            .decode_model(Path::new("x.png"), &ModelDesc::default(), &|_| {})
            .unwrap_err();
        assert!(matches!(err, ImportError::Unsupported(_)));
    }
}
