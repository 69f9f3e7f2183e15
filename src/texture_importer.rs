//! CPU-side texture decoding.
//!
//! Runs on worker threads: produces pixel buffers (and optionally a full mip
//! chain), never GPU objects.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Error type for the format decoders (textures and models).
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
    #[error("glTF decode error: {0}")]
    Gltf(#[from] gltf::Error),
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("decoder panicked: {0}")]
    Panicked(String),
}

/// Pixel format of a decoded texture. Everything is expanded to RGBA8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
}

impl TextureFormat {
    #[inline]
    pub const fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// Options controlling how a texture is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureDesc {
    /// Build the full mip chain down to 1x1 on the CPU.
    pub generate_mipmaps: bool,
    /// Treat the pixels as sRGB-encoded colour.
    pub srgb: bool,
    /// Flip rows so the first row in memory is the bottom of the image.
    pub flip_y: bool,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            generate_mipmaps: true,
            srgb: true,
            flip_y: false,
        }
    }
}

impl TextureDesc {
    /// Linear data such as normal or roughness maps.
    pub fn linear() -> Self {
        Self {
            srgb: false,
            ..Self::default()
        }
    }

    /// Hash of the options, part of the cache and dedup key.
    pub fn cache_key(&self) -> u64 {
        xxh3_64(&[
            b'T',
            self.generate_mipmaps as u8,
            self.srgb as u8,
            self.flip_y as u8,
        ])
    }

    pub fn format(&self) -> TextureFormat {
        if self.srgb {
            TextureFormat::Rgba8UnormSrgb
        } else {
            TextureFormat::Rgba8Unorm
        }
    }
}

#[derive(Debug, Clone)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Decoded texture, level 0 first.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mips: Vec<MipLevel>,
}

impl TextureData {
    /// Wraps raw RGBA8 pixels. Fails if the buffer length does not match.
    pub fn from_rgba8(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
        format: TextureFormat,
    ) -> Result<Self, ImportError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(ImportError::InvalidData(format!(
                "{} bytes do not describe a {width}x{height} RGBA8 image",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            mips: vec![MipLevel {
                width,
                height,
                pixels,
            }],
        })
    }

    #[inline]
    pub fn mip_level_count(&self) -> u32 {
        self.mips.len() as u32
    }

    /// Bytes across every mip level.
    pub fn size_bytes(&self) -> u64 {
        self.mips.iter().map(|m| m.pixels.len() as u64).sum()
    }
}

/// Number of levels in a full chain for a `width` x `height` image.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

pub struct TextureImporter;

impl TextureImporter {
    /// Detects the file type from the extension and decodes it to RGBA8.
    pub fn load_from_file(
        path: &Path,
        desc: &TextureDesc,
        progress: &dyn Fn(f32),
    ) -> Result<TextureData, ImportError> {
        let format = Self::format_for(path)?;

        let bytes = std::fs::read(path)?;
        progress(0.3);

        let image = image::load_from_memory_with_format(&bytes, format)?;
        drop(bytes);
        progress(0.6);

        Ok(Self::from_image(image.to_rgba8(), desc, progress))
    }

    /// Applies the decode options to an already decoded image.
    pub fn from_image(mut rgba: RgbaImage, desc: &TextureDesc, progress: &dyn Fn(f32)) -> TextureData {
        if desc.flip_y {
            imageops::flip_vertical_in_place(&mut rgba);
        }

        let (width, height) = rgba.dimensions();
        let levels = if desc.generate_mipmaps {
            mip_level_count(width, height)
        } else {
            1
        };

        let mut mips = Vec::with_capacity(levels as usize);
        for level in 1..levels {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            let scaled = imageops::resize(&rgba, w, h, FilterType::Triangle);
            mips.push(MipLevel {
                width: w,
                height: h,
                pixels: scaled.into_raw(),
            });
            progress(0.6 + 0.3 * level as f32 / levels as f32);
        }
        mips.insert(
            0,
            MipLevel {
                width,
                height,
                pixels: rgba.into_raw(),
            },
        );

        TextureData {
            width,
            height,
            format: desc.format(),
            mips,
        }
    }

    fn format_for(path: &Path) -> Result<ImageFormat, ImportError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            _ => Err(ImportError::Unsupported(format!(
                "unknown texture extension: .{extension}"
            ))),
        }
    }
}
