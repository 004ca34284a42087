//! Packed 64-bit sort keys for rendered features.
//!
//! Every feature headed for the external sorter carries one `i64` key that
//! packs, from most to least significant bit:
//!
//! ```text
//! [ tile id : 32 ][ layer id : 8 ][ draw order : 23 ][ has group : 1 ]
//! ```
//!
//! Sorting by this key alone makes all features of a tile contiguous, then all
//! features of a layer within that tile, then orders them by draw order with
//! ungrouped features ahead of grouped ones on ties.
//!
//! # Encoding details
//!
//! - The draw order is signed. It is shifted by `+2^22` before packing so the
//!   23-bit field sorts correctly as an unsigned value across the sign boundary.
//! - The tile id is an unsigned `u32`. The sign bit of the packed word is
//!   flipped, so comparing two keys as `i64` gives the same answer as comparing
//!   their fields as unsigned numbers. Tile ids at or above `2^31` therefore
//!   still sort after smaller ones.
//! - Out-of-range draw orders are clamped to [`SORT_KEY_MIN`, `SORT_KEY_MAX`].

/// Smallest draw order that survives packing unchanged.
pub const SORT_KEY_MIN: i32 = -(1 << 22);

/// Largest draw order that survives packing unchanged.
pub const SORT_KEY_MAX: i32 = (1 << 22) - 1;

const SORT_KEY_BITS: u32 = 23;
const SORT_KEY_MASK: u64 = (1 << SORT_KEY_BITS) - 1;
const LAYER_SHIFT: u32 = 1 + SORT_KEY_BITS;
const TILE_SHIFT: u32 = LAYER_SHIFT + 8;
const SIGN_FLIP: u64 = 1 << 63;

/// The four fields packed into a sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyParts {
    pub tile: u32,
    pub layer: u8,
    pub sort_key: i32,
    pub has_group: bool,
}

/// Clamp a draw order into the range representable by the packed key.
#[inline]
pub fn clamp_sort_key(sort_key: i32) -> i32 {
    sort_key.clamp(SORT_KEY_MIN, SORT_KEY_MAX)
}

/// Pack a tile id, layer id, draw order and group flag into one sortable key.
///
/// # Example
///
/// ```
/// use tilestream_core::sort_key::{encode_key, extract_sort_key, extract_tile};
///
/// let key = encode_key(42, 3, -7, true);
/// assert_eq!(extract_tile(key), 42);
/// assert_eq!(extract_sort_key(key), -7);
/// assert!(encode_key(42, 3, -8, true) < key);
/// ```
#[inline]
pub fn encode_key(tile: u32, layer: u8, sort_key: i32, has_group: bool) -> i64 {
    let biased = (clamp_sort_key(sort_key) as i64 - SORT_KEY_MIN as i64) as u64;
    let packed = ((tile as u64) << TILE_SHIFT)
        | ((layer as u64) << LAYER_SHIFT)
        | ((biased & SORT_KEY_MASK) << 1)
        | has_group as u64;
    (packed ^ SIGN_FLIP) as i64
}

#[inline]
fn unpack(key: i64) -> u64 {
    (key as u64) ^ SIGN_FLIP
}

/// Tile id stored in a packed key.
#[inline]
pub fn extract_tile(key: i64) -> u32 {
    (unpack(key) >> TILE_SHIFT) as u32
}

/// Layer id stored in a packed key.
#[inline]
pub fn extract_layer(key: i64) -> u8 {
    (unpack(key) >> LAYER_SHIFT) as u8
}

/// Draw order stored in a packed key, with the bias removed.
#[inline]
pub fn extract_sort_key(key: i64) -> i32 {
    (((unpack(key) >> 1) & SORT_KEY_MASK) as i64 + SORT_KEY_MIN as i64) as i32
}

/// Whether the feature behind this key carries a group descriptor.
#[inline]
pub fn extract_has_group(key: i64) -> bool {
    unpack(key) & 1 == 1
}

/// Unpack every field of a key at once.
pub fn decode_key(key: i64) -> KeyParts {
    KeyParts {
        tile: extract_tile(key),
        layer: extract_layer(key),
        sort_key: extract_sort_key(key),
        has_group: extract_has_group(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    #[test]
    fn test_negative_sort_keys_order_before_positive() {
        assert!(encode_key(0, 0, -2, true) < encode_key(0, 0, -1, false));
        assert!(encode_key(0, 0, -1, false) < encode_key(0, 0, 1, false));
    }

    #[test]
    fn test_ungrouped_sorts_before_grouped() {
        assert!(encode_key(u32::MAX, 0, -1, false) < encode_key(u32::MAX, 0, -1, true));
        assert!(encode_key(1, 0, 1, false) < encode_key(1, 0, 1, true));
    }

    #[test]
    fn test_tile_dominates_layer_and_order() {
        assert!(encode_key(1, 255, SORT_KEY_MAX, true) < encode_key(2, 0, SORT_KEY_MIN, false));
        assert!(encode_key(7, 1, SORT_KEY_MAX, true) < encode_key(7, 2, SORT_KEY_MIN, false));
    }

    #[test]
    fn test_tile_order_is_unsigned() {
        // Tile ids past the i32 range must not wrap to the front.
        assert!(encode_key(0, 0, 0, false) < encode_key(1 << 31, 0, 0, false));
        assert!(encode_key(i32::MAX as u32, 0, 0, false) < encode_key(u32::MAX, 0, 0, false));
    }

    // -------------------------------------------------------------------------
    // Round trips and clamping
    // -------------------------------------------------------------------------

    #[test]
    fn test_extremes_round_trip() {
        for (tile, layer, order, group) in [
            (0u32, 0u8, SORT_KEY_MIN, false),
            (u32::MAX, 255, SORT_KEY_MAX, true),
            (12345, 17, 0, true),
            (1, 1, -1, false),
        ] {
            let parts = decode_key(encode_key(tile, layer, order, group));
            assert_eq!(
                parts,
                KeyParts {
                    tile,
                    layer,
                    sort_key: order,
                    has_group: group
                }
            );
        }
    }

    #[test]
    fn test_out_of_range_sort_key_is_clamped() {
        let key = encode_key(3, 4, SORT_KEY_MAX + 100, false);
        assert_eq!(extract_sort_key(key), SORT_KEY_MAX);
        assert_eq!(extract_tile(key), 3);
        assert_eq!(extract_layer(key), 4);

        let key = encode_key(3, 4, i32::MIN, true);
        assert_eq!(extract_sort_key(key), SORT_KEY_MIN);
        assert!(extract_has_group(key));
    }

    proptest! {
        #[test]
        fn prop_encode_decode_round_trip(
            tile in any::<u32>(),
            layer in any::<u8>(),
            order in SORT_KEY_MIN..=SORT_KEY_MAX,
            group in any::<bool>(),
        ) {
            let parts = decode_key(encode_key(tile, layer, order, group));
            prop_assert_eq!(parts.tile, tile);
            prop_assert_eq!(parts.layer, layer);
            prop_assert_eq!(parts.sort_key, order);
            prop_assert_eq!(parts.has_group, group);
        }

        #[test]
        fn prop_key_order_matches_field_order(
            a in (any::<u32>(), any::<u8>(), SORT_KEY_MIN..=SORT_KEY_MAX, any::<bool>()),
            b in (any::<u32>(), any::<u8>(), SORT_KEY_MIN..=SORT_KEY_MAX, any::<bool>()),
        ) {
            let ka = encode_key(a.0, a.1, a.2, a.3);
            let kb = encode_key(b.0, b.1, b.2, b.3);
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }
    }
}
