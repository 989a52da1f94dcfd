//! Protocol decoders.
//!
//! Each module contains a `Decoder` implementation and pure parsing helpers
//! for one vendor dialect. Per the decoder-families design, the
//! listener pool (in `gateway-server`) is protocol-agnostic: it only ever
//! talks to the `Decoder` trait below, dispatching each connection to one
//! `Box<dyn Decoder>` instance that owns whatever per-connection state that
//! protocol needs (GPS103's photo-packet buffer, for instance).

pub mod gps103;
pub mod h02;
pub mod osmand;
pub mod teltonika;

use crate::model::{NormalizedRecord, Transport};

/// `(bytes|str, transport) -> seq<Record>`.
///
/// Implementors must not panic on malformed input: return whatever records
/// could be extracted and drop the rest. One `Decoder` instance is owned per
/// connection so per-connection reassembly state (photo buffers, codec
/// tables) lives naturally in `&mut self`.
pub trait Decoder {
    fn decode(&mut self, frame: &[u8], transport: Transport) -> Vec<NormalizedRecord>;
}

/// Convert knots to km/h (GPS103 and H02 both report speed in knots).
pub fn knots_to_kmh(knots: f64) -> f64 {
    knots * 1.852
}

/// Parse a `DDMM.mmmm` / `DDDMM.mmmm` style coordinate: `deg_digits` holds all
/// digits before the decimal point in the minutes field, the last two of
/// which are whole minutes; everything before that is whole degrees.
///
/// `raw` is the full numeric token, e.g. `"1202.4000"` for `1202.4000` meaning
/// 12 degrees, 02.4000 minutes.
pub fn parse_ddmm(raw: &str, degree_digits: usize) -> Option<f64> {
    if raw.len() < degree_digits {
        return None;
    }
    let (deg_str, min_str) = raw.split_at(degree_digits);
    let degrees: f64 = deg_str.parse().ok()?;
    let minutes: f64 = min_str.parse().ok()?;
    if !(0.0..60.0).contains(&minutes) {
        return None;
    }
    Some(degrees + minutes / 60.0)
}

/// Apply hemisphere sign: `N`/`E` positive, `S`/`W` negative.
pub fn apply_hemisphere(value: f64, hemisphere: char) -> f64 {
    match hemisphere.to_ascii_uppercase() {
        'S' | 'W' => -value.abs(),
        _ => value.abs(),
    }
}

/// Extract a null-terminated string from a binary field, as several binary
/// dialects (Teltonika IMEI-ASCII, H02 status blobs) embed them.
pub fn c_string(bytes: &[u8]) -> Option<String> {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..null_pos])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knots_conversion() {
        assert!((knots_to_kmh(10.0) - 18.52).abs() < 1e-9);
    }

    #[test]
    fn ddmm_parses_degrees_and_minutes() {
        // 1202.4000 -> 12 deg, 02.4000 min -> 12 + 0.04 = 12.04
        let v = parse_ddmm("1202.4000", 2).unwrap();
        assert!((v - 12.04).abs() < 1e-6);
    }

    #[test]
    fn ddmm_rejects_out_of_range_minutes() {
        assert!(parse_ddmm("1265.0000", 2).is_none());
    }

    #[test]
    fn hemisphere_sign() {
        assert!(apply_hemisphere(12.04, 'S') < 0.0);
        assert!(apply_hemisphere(12.04, 'N') > 0.0);
    }

    #[test]
    fn test_c_string() {
        assert_eq!(c_string(b"hello\0world"), Some("hello".to_string()));
        assert_eq!(c_string(b"hello"), Some("hello".to_string()));
        assert_eq!(c_string(b"\0"), None);
    }
}
