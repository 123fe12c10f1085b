//! FNV-1a hashing for identity and change-detection hashes.
//!
//! These values are compared across runs and machines, so they must not use
//! `std`'s randomly seeded hasher.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut h = Fnv1a::new();
    h.mix(data);
    h.finish()
}

/// Incremental FNV-1a state.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    pub fn mix(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Strings are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn mix_str(&mut self, s: &str) {
        self.mix(&(s.len() as u64).to_le_bytes());
        self.mix(s.as_bytes());
    }

    pub fn mix_u64(&mut self, v: u64) {
        self.mix(&v.to_le_bytes());
    }

    pub fn mix_i64(&mut self, v: i64) {
        self.mix(&v.to_le_bytes());
    }

    pub fn mix_f64(&mut self, v: f64) {
        self.mix(&v.to_bits().to_le_bytes());
    }

    pub fn mix_bool(&mut self, v: bool) {
        self.mix(&[v as u8]);
    }

    pub fn finish(&self) -> u64 {
        self.0
    }

    /// Folds the 64-bit state into 32 bits.
    pub fn finish_u32(&self) -> u32 {
        (self.0 ^ (self.0 >> 32)) as u32
    }
}
