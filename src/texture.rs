use std::{collections::HashMap, path::PathBuf};

use image::DynamicImage;

/// Pixels at or below this alpha count as see-through.
pub const CLEAR_ALPHA: f32 = 0.05;
/// Pixels below this alpha count toward the transparent ratio.
pub const OPAQUE_ALPHA: f32 = 0.995;

/// Alpha-channel summary of one texture.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlphaStats {
    /// Any pixel with alpha ≤ [`CLEAR_ALPHA`].
    pub has_clear_pixel: bool,
    /// Fraction of pixels with alpha < [`OPAQUE_ALPHA`].
    pub transparent_ratio: f32,
}

/// Scan the alpha channel of `image`. Images without alpha are fully opaque.
pub fn analyze_alpha(image: &DynamicImage) -> AlphaStats {
    if !image.color().has_alpha() {
        return AlphaStats::default();
    }

    let rgba = image.to_rgba8();
    let total = rgba.width() as usize * rgba.height() as usize;
    if total == 0 {
        return AlphaStats::default();
    }

    let clear_limit = (CLEAR_ALPHA * 255.0).floor() as u8;
    let opaque_limit = (OPAQUE_ALPHA * 255.0).ceil() as u8;
    let mut has_clear_pixel = false;
    let mut transparent = 0usize;
    for pixel in rgba.pixels() {
        let alpha = pixel.0[3];
        if alpha <= clear_limit {
            has_clear_pixel = true;
        }
        if alpha < opaque_limit {
            transparent += 1;
        }
    }

    AlphaStats {
        has_clear_pixel,
        transparent_ratio: transparent as f32 / total as f32,
    }
}

/// File extension for an encoded image, from its leading signature bytes.
pub fn sniff_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else {
        None
    }
}

/// Lazily decoded alpha statistics per model texture index.
///
/// Each texture file is decoded at most once; undecodable files are cached as
/// having no alpha information.
#[derive(Debug, Default)]
pub struct TextureAlphaCache {
    sources: HashMap<usize, PathBuf>,
    stats: HashMap<usize, Option<AlphaStats>>,
}

impl TextureAlphaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_source(&mut self, texture_index: usize, path: PathBuf) {
        self.stats.remove(&texture_index);
        self.sources.insert(texture_index, path);
    }

    /// Pre-computed statistics, bypassing file decoding.
    pub fn insert_stats(&mut self, texture_index: usize, stats: AlphaStats) {
        self.stats.insert(texture_index, Some(stats));
    }

    pub fn stats(&mut self, texture_index: usize) -> Option<AlphaStats> {
        if let Some(cached) = self.stats.get(&texture_index) {
            return *cached;
        }
        let decoded = self.sources.get(&texture_index).and_then(|path| {
            match image::open(path) {
                Ok(image) => Some(analyze_alpha(&image)),
                Err(err) => {
                    log::warn!("could not decode texture {}: {err}", path.display());
                    None
                }
            }
        });
        self.stats.insert(texture_index, decoded);
        decoded
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn given_rgb_image_when_analyzing_then_it_is_opaque() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])));

        assert_eq!(analyze_alpha(&image), AlphaStats::default());
    }

    #[test]
    fn given_half_transparent_image_when_analyzing_then_ratio_and_clear_flag_are_set() {
        let mut rgba = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 128]));

        let stats = analyze_alpha(&DynamicImage::ImageRgba8(rgba));

        assert!(stats.has_clear_pixel);
        assert!((stats.transparent_ratio - 0.5).abs() < 1e-6);
    }

    #[test]
    fn given_signatures_when_sniffing_then_extensions_match() {
        assert_eq!(
            sniff_image_extension(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0]),
            Some("png")
        );
        assert_eq!(sniff_image_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpg"));
        assert_eq!(sniff_image_extension(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_image_extension(b"GIF89a.."), Some("gif"));
        assert_eq!(sniff_image_extension(b"BM......"), Some("bmp"));
        assert_eq!(sniff_image_extension(b"????"), None);
    }

    #[test]
    fn given_texture_file_when_querying_twice_then_stats_are_cached() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alpha.png");
        RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])).save(&path).unwrap();
        let mut cache = TextureAlphaCache::new();
        cache.insert_source(3, path.clone());

        let first = cache.stats(3).unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = cache.stats(3).unwrap();

        assert!(first.has_clear_pixel);
        assert_eq!(first, second);
        assert!(cache.stats(4).is_none());
    }
}
