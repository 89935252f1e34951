//! Difficulty arithmetic for the chain.
//!
//! Targets are 256-bit-range integers. On the wire they travel as 32-bit
//! "compact bits": the top byte is a byte count, the low three bytes are the
//! most significant bytes of the value. The encoding piggybacks on the MPI
//! format (4-byte big-endian length, big-endian magnitude, sign in the MSB),
//! which is why a mantissa with its top bit set would read as negative and
//! has to be shifted into the next size class when encoding.
//!
//! Work is the expected number of hashes needed to hit a target:
//! `2^256 / (target + 1)`.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{ToPrimitive, Zero};

/// Sign bit of the compact mantissa
const COMPACT_SIGN_BIT: u32 = 0x0080_0000;

// ─── MPI ────────────────────────────────────────────────────────────

/// Encode as MPI: 4-byte big-endian length followed by the big-endian
/// magnitude, with the sign carried in the top bit of the first byte.
pub fn encode_mpi(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        return vec![0, 0, 0, 0];
    }
    let (sign, magnitude) = value.to_bytes_be();
    let pad = magnitude[0] & 0x80 != 0;
    let len = magnitude.len() + pad as usize;

    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(&magnitude);
    if sign == Sign::Minus {
        out[4] |= 0x80;
    }
    out
}

/// Decode an MPI buffer. Bytes past the declared length are ignored; a
/// declared length longer than the buffer is clamped to what is present.
pub fn decode_mpi(mpi: &[u8]) -> BigInt {
    if mpi.len() < 4 {
        return BigInt::zero();
    }
    let declared = u32::from_be_bytes([mpi[0], mpi[1], mpi[2], mpi[3]]) as usize;
    let end = (4 + declared).min(mpi.len());
    let mut buf = mpi[4..end].to_vec();
    if buf.is_empty() {
        return BigInt::zero();
    }
    let negative = buf[0] & 0x80 != 0;
    if negative {
        buf[0] &= 0x7f;
    }
    let magnitude = BigInt::from_bytes_be(Sign::Plus, &buf);
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

// ─── Compact bits ───────────────────────────────────────────────────

/// Expand compact bits into the target they stand for.
///
/// Returns `None` when the sign bit marks the value negative, which no
/// target can be.
pub fn decode_compact(compact: u32) -> Option<BigUint> {
    let size = (compact >> 24) as usize;
    let mut mpi = vec![0u8; 4 + size];
    mpi[3] = size as u8;
    if size >= 1 {
        mpi[4] = (compact >> 16) as u8;
    }
    if size >= 2 {
        mpi[5] = (compact >> 8) as u8;
    }
    if size >= 3 {
        mpi[6] = compact as u8;
    }
    decode_mpi(&mpi).to_biguint()
}

/// Pack a target into compact bits, keeping its three most significant bytes.
///
/// Exact inverse of [`decode_compact`] for every value that function produces
/// from a normalized encoding.
pub fn encode_compact(value: &BigUint) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.to_bytes_be().len() as u32;
    let mut mantissa = if size <= 3 {
        value.to_u32().unwrap_or(0) << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3) as usize)).to_u32().unwrap_or(0)
    };
    if mantissa & COMPACT_SIGN_BIT != 0 {
        mantissa >>= 8;
        size += 1;
    }
    mantissa | (size << 24)
}

// ─── Work ───────────────────────────────────────────────────────────

/// 2^256 / (target + 1): a larger target means less work.
pub fn work(target: &BigUint) -> BigUint {
    let largest: BigUint = BigUint::from(1u8) << 256usize;
    largest / (target + 1u32)
}

// ─── Retargeting ────────────────────────────────────────────────────

/// Target for the first block of a new interval.
///
/// `timespan` is the seconds spanned by the closing interval; it is clamped to
/// a factor of four either side of `target_timespan` before scaling, and the
/// result never exceeds `limit`.
pub fn retarget(
    interval_start_target: &BigUint,
    timespan: i64,
    target_timespan: u32,
    limit: &BigUint,
) -> BigUint {
    let target_timespan = i64::from(target_timespan.max(1));
    let timespan = timespan.clamp((target_timespan / 4).max(1), target_timespan * 4);
    let scaled = interval_start_target * (timespan as u64) / (target_timespan as u64);
    if &scaled > limit {
        limit.clone()
    } else {
        scaled
    }
}

/// Keep only the bytes of `target` that compact bits with exponent
/// `(bits >> 24)` can represent.
pub fn mask_to_precision(target: &BigUint, bits: u32) -> BigUint {
    let accuracy_bytes = (bits >> 24) as i64 - 3;
    let mantissa_mask = BigUint::from(0x00ff_ffffu32);
    let mask = if accuracy_bytes >= 0 {
        mantissa_mask << (8 * accuracy_bytes) as usize
    } else {
        mantissa_mask >> (8 * -accuracy_bytes) as usize
    };
    target & mask
}

/// Human readable difficulty relative to `limit` (1.0 at the limit).
pub fn difficulty_ratio(target: &BigUint, limit: &BigUint) -> f64 {
    match (limit.to_f64(), target.to_f64()) {
        (Some(l), Some(t)) if t > 0.0 => l / t,
        _ => 0.0,
    }
}
