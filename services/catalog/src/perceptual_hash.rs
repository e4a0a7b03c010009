//! Perceptual hashing of uploaded images.
//!
//! Uses the Blockhash algorithm, producing a 64-bit hash that survives
//! re-encoding and mild resizing. The hash is stored hex-encoded.

use crate::ports::PerceptualHasher;
use anyhow::{Context, Result};
use blockhash::{blockhash64, Blockhash64};

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockhashHasher;

impl BlockhashHasher {
    pub fn new() -> Self {
        Self
    }
}

impl PerceptualHasher for BlockhashHasher {
    fn hash(&self, image: &[u8]) -> Result<String> {
        let decoded = image::load_from_memory(image).context("Failed to decode image")?;
        let hash: Blockhash64 = blockhash64(&decoded);
        let bytes: [u8; 8] = hash.into();
        Ok(hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn jpeg(seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(32, 32, |x, y| {
            image::Rgb([(x as u8).wrapping_mul(seed), (y as u8).wrapping_mul(7), seed])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_hash_is_hex_encoded_64_bits() {
        let hash = BlockhashHasher::new().hash(&jpeg(3)).unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = BlockhashHasher::new();
        let image = jpeg(9);
        assert_eq!(hasher.hash(&image).unwrap(), hasher.hash(&image).unwrap());
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        assert!(BlockhashHasher::new().hash(b"definitely not a jpeg").is_err());
    }
}
