//! Tile coordinates and their compact integer encoding.
//!
//! Tiles are addressed as `z/x/y`. For sorting, each coordinate is encoded to a
//! single `u32`: its cumulative position on the series of Hilbert curves that
//! starts at zoom 0 (the PMTiles tile id scheme). All tiles of a zoom level are
//! contiguous and neighbouring tiles tend to have nearby ids.
//!
//! - Z=0, X=0, Y=0 → 0
//! - Z=1, X=0, Y=0 → 1
//! - Z=1, X=0, Y=1 → 2
//! - Z=1, X=1, Y=1 → 3
//! - Z=1, X=1, Y=0 → 4
//! - Z=2, X=0, Y=0 → 5

use std::fmt;

/// Highest zoom level whose tile ids fit in 32 bits.
pub const MAX_ZOOM: u8 = 15;

/// Tile coordinates: x, y, and zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    /// Create a new tile coordinate
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Whether `x` and `y` lie inside the grid of zoom `z`, and `z <= MAX_ZOOM`.
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let n = 1u32 << self.z;
        self.x < n && self.y < n
    }

    /// Encode to the Hilbert tile id used as the primary sort field.
    ///
    /// Callers are expected to pass valid coordinates (see [`TileCoord::is_valid`]).
    pub fn encoded(&self) -> u32 {
        (zoom_base(self.z) + xy_to_hilbert(self.z, self.x, self.y)) as u32
    }

    /// Decode a tile id produced by [`TileCoord::encoded`].
    pub fn decode(id: u32) -> Self {
        let id = id as u64;
        let mut z = 0u8;
        while z < MAX_ZOOM && zoom_base(z + 1) <= id {
            z += 1;
        }
        let (x, y) = hilbert_to_xy(z, id - zoom_base(z));
        Self { x, y, z }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Number of tiles in all zoom levels below `z`.
fn zoom_base(z: u8) -> u64 {
    (0..z as u32).map(|i| 4u64.pow(i)).sum()
}

/// Convert x,y coordinates to Hilbert curve index at zoom level z
fn xy_to_hilbert(z: u8, x: u32, y: u32) -> u64 {
    let n = 1u64 << z;
    let (mut x, mut y) = (x as u64, y as u64);
    let mut d = 0u64;

    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        rotate(n, &mut x, &mut y, rx, ry);
        s /= 2;
    }
    d
}

/// Inverse of [`xy_to_hilbert`].
fn hilbert_to_xy(z: u8, d: u64) -> (u32, u32) {
    let n = 1u64 << z;
    let (mut x, mut y) = (0u64, 0u64);
    let mut t = d;

    let mut s = 1u64;
    while s < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        rotate(s, &mut x, &mut y, rx, ry);
        x += s * rx;
        y += s * ry;
        t /= 4;
        s *= 2;
    }
    (x as u32, y as u32)
}

fn rotate(n: u64, x: &mut u64, y: &mut u64, rx: u64, ry: u64) {
    if ry == 0 {
        if rx == 1 {
            *x = n - 1 - *x;
            *y = n - 1 - *y;
        }
        std::mem::swap(x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_id_zoom_0() {
        assert_eq!(TileCoord::new(0, 0, 0).encoded(), 0);
    }

    #[test]
    fn test_tile_id_zoom_1_order() {
        assert_eq!(TileCoord::new(0, 0, 1).encoded(), 1);
        assert_eq!(TileCoord::new(0, 1, 1).encoded(), 2);
        assert_eq!(TileCoord::new(1, 1, 1).encoded(), 3);
        assert_eq!(TileCoord::new(1, 0, 1).encoded(), 4);
        assert_eq!(TileCoord::new(0, 0, 2).encoded(), 5);
    }

    #[test]
    fn test_tile_id_round_trip_low_zooms() {
        for z in 0..=5u8 {
            let n = 1u32 << z;
            for y in 0..n {
                for x in 0..n {
                    let coord = TileCoord::new(x, y, z);
                    assert_eq!(TileCoord::decode(coord.encoded()), coord);
                }
            }
        }
    }

    #[test]
    fn test_tile_id_round_trip_max_zoom_corners() {
        let max = (1u32 << MAX_ZOOM) - 1;
        for (x, y) in [(0, 0), (max, 0), (0, max), (max, max), (12345, 23456)] {
            let coord = TileCoord::new(x, y, MAX_ZOOM);
            assert_eq!(TileCoord::decode(coord.encoded()), coord);
        }
        // Highest id still fits in a non-negative i32
        assert!(TileCoord::new(max, 0, MAX_ZOOM).encoded() < i32::MAX as u32);
    }

    #[test]
    fn test_tile_ids_increase_with_zoom() {
        for z in 0..=4u8 {
            let n = 1u32 << z;
            let max_at_z = (0..n)
                .flat_map(|y| (0..n).map(move |x| TileCoord::new(x, y, z).encoded()))
                .max()
                .unwrap();
            assert!(max_at_z < TileCoord::new(0, 0, z + 1).encoded());
        }
    }

    #[test]
    fn test_is_valid() {
        assert!(TileCoord::new(0, 0, 0).is_valid());
        assert!(!TileCoord::new(1, 0, 0).is_valid());
        assert!(TileCoord::new(3, 3, 2).is_valid());
        assert!(!TileCoord::new(0, 0, MAX_ZOOM + 1).is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(TileCoord::new(3, 5, 4).to_string(), "4/3/5");
    }
}
