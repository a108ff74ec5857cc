// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Name hashing for the redirect table. */

/// Multiplier of the hash. Also the seed of the primary hash.
pub const HASH_MULTIPLIER: u32 = 0x0100_0193;

/// Hash a full resource name with a given seed.
///
/// The bytes are folded FNV style, then the state is run through a 32-bit
/// avalanche finalizer. Without the finalizer the low bits of the result
/// only depend on the low bits of the seed, which defeats rehashing into
/// power of two sized tables.
///
/// The result is always non-negative when interpreted as an `i32`.
#[inline]
pub fn hash_code(name: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    for b in name {
        h = h.wrapping_mul(HASH_MULTIPLIER) ^ (*b as u32);
    }

    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    h & 0x7fff_ffff
}

/// Primary hash of a name.
#[inline]
pub fn primary_hash(name: &[u8]) -> u32 {
    hash_code(name, HASH_MULTIPLIER)
}

/// Resolve the primary bucket of a name in a table of `length` buckets.
///
/// `length` must not be 0.
#[inline]
pub fn bucket(name: &[u8], length: u32) -> u32 {
    primary_hash(name) % length
}

/// Resolve the slot a seeded rehash lands on.
///
/// `length` must not be 0.
#[inline]
pub fn seeded_slot(name: &[u8], seed: i32, length: u32) -> u32 {
    hash_code(name, seed as u32) % length
}
