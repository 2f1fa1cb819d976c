//! Modified Rabin-Karp rolling hash, base 257, modulus 2^64.
//!
//! The canonical RK hash of a window (here for 4 bytes) is
//!
//! ```text
//! hash = ( v1*b^3 + v2*b^2 + v3*b + v4 ) % m
//! ```
//!
//! We mix `b^len` into the sum:
//!
//! ```text
//! hash = ( b^4 + v1*b^3 + v2*b^2 + v3*b + v4 ) % m
//! ```
//!
//! The extra member depends on the window length, which separates
//! sequences that differ only in the number of leading zero bytes (those
//! contribute nothing to the canonical sum).
//!
//! Base choice: 257 is the first prime larger than any byte value, and
//! has only two bits set, so the multiply reduces to `(v << 8) + v`.
//! Smaller primes collide trivially (the two-byte sequences `1, 0` and
//! `0, base` hash equal).
//!
//! Modulus choice: with 32 bits the birthday bound is hit after ~77k
//! hashes; with 64 bits the same collision probability needs ~5 billion
//! hashes, which at 64 KiB windows is hundreds of terabytes of stored
//! data.

/// 64-bit rolling hash digest.
pub type Digest = u64;

#[derive(Debug, Clone)]
pub struct RollingHash {
    factor:      u64,
    next_factor: u64,
    value:       u64,
    count:       usize,
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingHash {
    pub fn new() -> Self {
        Self { factor: 0, next_factor: 1, value: 0, count: 0 }
    }

    pub fn reset(&mut self) {
        self.factor = 0;
        self.next_factor = 1;
        self.value = 0;
        self.count = 0;
    }

    /// Append a byte, extending the window by one.
    #[inline]
    pub fn roll_in(&mut self, c: u8) {
        self.factor = self.next_factor;
        // next_factor *= 257
        self.next_factor = (self.next_factor << 8).wrapping_add(self.next_factor);
        self.value = (self.value << 8).wrapping_add(self.value);
        self.value = self.value.wrapping_add(c as u64);
        self.count += 1;
    }

    /// Drop the oldest byte and append a new one; window length unchanged.
    #[inline]
    pub fn rotate(&mut self, input: u8, output: u8) {
        self.value = self
            .value
            .wrapping_sub((output as u64).wrapping_mul(self.factor));
        self.value = (self.value << 8).wrapping_add(self.value); // value *= 257
        self.value = self.value.wrapping_add(input as u64);
    }

    #[inline]
    pub fn digest(&self) -> Digest {
        self.value.wrapping_add(self.next_factor)
    }

    /// Number of bytes rolled into the window so far.
    pub fn size(&self) -> usize {
        self.count
    }

    /// One-shot digest of a complete buffer.
    pub fn digest_of(buf: &[u8]) -> Digest {
        let mut hash = RollingHash::new();
        for &b in buf {
            hash.roll_in(b);
        }
        hash.digest()
    }
}
