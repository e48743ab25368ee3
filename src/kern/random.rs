//! Kernel pseudo-random numbers
//!
//! xorshift64* generator used for victim sampling and TLB random
//! replacement. Not suitable for anything security-related.

/// xorshift64* generator
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    /// Seed the generator; a zero seed is remapped since xorshift never leaves zero
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x2545_F491_4F6C_DD1D } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `[0, bound)`; `bound` must be non-zero
    pub fn below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.next_u64() % bound as u64) as usize
    }

    /// Value in `[low, high)`
    pub fn range(&mut self, low: usize, high: usize) -> usize {
        low + self.below(high - low)
    }
}
