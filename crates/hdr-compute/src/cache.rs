//! Single-entry memo of the last reference result.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use hdr_core::ImageSize;

/// Identifies one input image: its dimensions and a hash of its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub size: ImageSize,
    pub digest: u64,
}

impl Fingerprint {
    pub fn of(input: &[u8], size: ImageSize) -> Self {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        Self {
            size,
            digest: hasher.finish(),
        }
    }
}

/// Holds the reference output of the most recent input.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entry: Option<(Fingerprint, Vec<u8>)>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&[u8]> {
        match &self.entry {
            Some((fp, data)) if fp == fingerprint => Some(data),
            _ => None,
        }
    }

    /// Replaces the cached entry.
    pub fn store(&mut self, fingerprint: Fingerprint, output: &[u8]) {
        match &mut self.entry {
            Some((fp, data)) if data.len() == output.len() => {
                *fp = fingerprint;
                data.copy_from_slice(output);
            }
            _ => self.entry = Some((fingerprint, output.to_vec())),
        }
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let size = ImageSize::new(1, 1).unwrap();
        let a = Fingerprint::of(&[1, 2, 3, 4], size);
        let b = Fingerprint::of(&[1, 2, 3, 5], size);
        assert_ne!(a, b);

        let mut cache = ReferenceCache::new();
        assert!(cache.get(&a).is_none());
        cache.store(a, &[9, 9, 9, 9]);
        assert_eq!(cache.get(&a), Some(&[9u8, 9, 9, 9][..]));
        assert!(cache.get(&b).is_none());

        cache.store(b, &[7, 7, 7, 7]);
        assert!(cache.get(&a).is_none());
        assert_eq!(cache.get(&b).unwrap()[0], 7);
    }

    #[test]
    fn test_same_bytes_different_shape() {
        let data = [0u8; 16];
        let wide = Fingerprint::of(&data, ImageSize::new(4, 1).unwrap());
        let tall = Fingerprint::of(&data, ImageSize::new(1, 4).unwrap());
        assert_ne!(wide, tall);
    }

    #[test]
    fn test_clear() {
        let size = ImageSize::new(1, 1).unwrap();
        let mut cache = ReferenceCache::new();
        cache.store(Fingerprint::of(&[0; 4], size), &[0; 4]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
