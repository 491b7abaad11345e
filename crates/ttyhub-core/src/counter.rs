//! 28-bit wraparound byte counters.
//!
//! Viewers acknowledge output by reporting how many bytes they have
//! processed, modulo 2^28. All arithmetic on those counts goes through the
//! helpers here so that wraparound is explicit rather than an accident of
//! integer width.

/// Mask selecting the low 28 bits.
pub const MASK28: u32 = (1 << 28) - 1;

/// Half of the counter space; distances at or above this are "behind".
const HALF: u32 = 1 << 27;

/// Reduce any count to the 28-bit range.
pub fn wrap(n: u64) -> u32 {
    (n & u64::from(MASK28)) as u32
}

/// `a + n` modulo 2^28.
pub fn add(a: u32, n: usize) -> u32 {
    wrap(u64::from(a) + n as u64)
}

/// `(a - b)` modulo 2^28, always in `0..2^28`.
pub fn diff(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b) & MASK28
}

/// Signed distance from `from` to `to`.
///
/// Results in the upper half of the 28-bit space are reported as negative,
/// meaning `to` lies behind `from`.
pub fn distance(from: u32, to: u32) -> i32 {
    let d = diff(to, from);
    if d >= HALF {
        d as i32 - (1 << 28)
    } else {
        d as i32
    }
}

/// Whether `to` is behind `from` (a stale report).
pub fn is_behind(from: u32, to: u32) -> bool {
    distance(from, to) < 0
}
