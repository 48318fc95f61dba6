//! Stable 64-bit hashing used by every index in the store.
//!
//! Byte spans (table types, names) are hashed with BLAKE3 and truncated to
//! 64 bits, so the same type vector produces the same hash across runs and
//! platforms. Integer keys (ids, table handles) go through a cheap splitmix64
//! finalizer via [`IdBuildHasher`].

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

use crate::id::Id;

/// Hash an arbitrary byte span to a stable 64-bit value.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(out)
}

/// Hash a sorted id vector (a table type).
///
/// Ids are fed in little-endian order so the result does not depend on the
/// host byte order.
pub fn hash_type(ids: &[Id]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(&id.to_raw().to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(out)
}

/// splitmix64 finalizer.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

// ---------------------------------------------------------------------------
// IdHasher
// ---------------------------------------------------------------------------

/// [`Hasher`] for integer keys. Falls back to BLAKE3 for byte writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdHasher {
    state: u64,
}

impl Hasher for IdHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        self.state = mix64(self.state ^ hash_bytes(bytes));
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.state = mix64(self.state ^ i as u64);
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.state = mix64(self.state ^ i);
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.state = mix64(self.state ^ i as u64);
    }
}

/// Build hasher for maps keyed by ids and handles.
pub type IdBuildHasher = BuildHasherDefault<IdHasher>;

/// `HashMap` using [`IdBuildHasher`].
pub type IdMap<K, V> = HashMap<K, V, IdBuildHasher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_stable() {
        assert_eq!(hash_bytes(b"position"), hash_bytes(b"position"));
        assert_ne!(hash_bytes(b"position"), hash_bytes(b"velocity"));
    }

    #[test]
    fn type_hash_depends_on_order() {
        let a = Id::from_raw(10);
        let b = Id::from_raw(11);
        assert_eq!(hash_type(&[a, b]), hash_type(&[a, b]));
        assert_ne!(hash_type(&[a, b]), hash_type(&[b, a]));
        assert_ne!(hash_type(&[]), hash_type(&[a]));
    }

    #[test]
    fn id_map_roundtrip() {
        let mut map: IdMap<u64, &str> = IdMap::default();
        map.insert(1, "one");
        map.insert(u64::MAX, "max");
        assert_eq!(map.get(&1), Some(&"one"));
        assert_eq!(map.get(&u64::MAX), Some(&"max"));
        assert_eq!(map.get(&2), None);
    }
}
