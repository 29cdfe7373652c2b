const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const MAX_PRECISION: usize = 12;

fn decode_char(c: u8) -> Option<u8> {
    BASE32.iter().position(|&b| b == c).map(|i| i as u8)
}

/// Chat names made only of geohash characters (1..=12 of them) address
/// location chats.
pub fn is_geohash(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PRECISION
        && name.bytes().all(|b| decode_char(b).is_some())
}

/// Center of the geohash cell as `(lat, lon)`.
pub fn decode_center(hash: &str) -> Option<(f64, f64)> {
    if !is_geohash(hash) {
        return None;
    }
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;
    for b in hash.bytes() {
        let bits = decode_char(b)?;
        for shift in (0..5).rev() {
            let on = (bits >> shift) & 1 == 1;
            let (lo, hi) = if even {
                (&mut lon_lo, &mut lon_hi)
            } else {
                (&mut lat_lo, &mut lat_hi)
            };
            let mid = (*lo + *hi) / 2.0;
            if on {
                *lo = mid;
            } else {
                *hi = mid;
            }
            even = !even;
        }
    }
    Some(((lat_lo + lat_hi) / 2.0, (lon_lo + lon_hi) / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_geohash_names() {
        assert!(is_geohash("u4pruydqqvj"));
        assert!(is_geohash("9q"));
        assert!(!is_geohash(""));
        assert!(!is_geohash("general"));
        assert!(!is_geohash("u4pruydqqvjxx"));
        assert!(!is_geohash("U4PR"));
    }

    #[test]
    fn decodes_cell_center() {
        let (lat, lon) = decode_center("u4pruydqqvj").unwrap();
        assert!((lat - 57.64911).abs() < 1e-3, "lat {lat}");
        assert!((lon - 10.40744).abs() < 1e-3, "lon {lon}");

        let (lat, lon) = decode_center("s").unwrap();
        assert!((lat - 22.5).abs() < 1e-9);
        assert!((lon - 22.5).abs() < 1e-9);
        assert!(decode_center("not-a-hash").is_none());
    }
}
