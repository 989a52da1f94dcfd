//! OsmAnd (HTTP-request-per-line) decoder.
//!
//! Grounded on `original_source/src/tcp/parser/osmand.py::decode_osmand`:
//! split on the `\r\n\r\n` request boundary, parse each request line's query
//! string, skip anything malformed with a warning rather than failing the
//! whole batch.

use chrono::{TimeZone, Utc};

use crate::model::{NormalizedRecord, Transport};
use crate::protocol::{knots_to_kmh, Decoder};

#[derive(Debug, Default)]
pub struct OsmAndDecoder;

impl OsmAndDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_request(&self, request_text: &str) -> Option<NormalizedRecord> {
        let first_line = request_text.split("\r\n").next()?;
        let path_with_query = first_line.split(' ').nth(1)?;
        let query = path_with_query.split_once('?').map(|(_, q)| q).unwrap_or("");

        let params: std::collections::HashMap<&str, &str> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .collect();

        let uniqueid = params.get("id").copied()?.to_string();
        let lat: f64 = params.get("lat")?.parse().ok()?;
        let lon: f64 = params.get("lon")?.parse().ok()?;
        let speed_kn: f64 = params.get("speed").and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let course: f64 = params.get("bearing").and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let timestamp: i64 = params.get("timestamp")?.parse().ok()?;
        let datetime = Utc.timestamp_opt(timestamp, 0).single()?;

        Some(NormalizedRecord::Position {
            uniqueid,
            datetime,
            lat,
            lon,
            speed: knots_to_kmh(speed_kn),
            course,
            valid: true,
            extras: Default::default(),
        })
    }
}

impl Decoder for OsmAndDecoder {
    fn decode(&mut self, frame: &[u8], _transport: Transport) -> Vec<NormalizedRecord> {
        let Ok(text) = std::str::from_utf8(frame) else {
            return vec![];
        };
        text.trim()
            .split("\r\n\r\n")
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .filter_map(|r| {
                let record = self.decode_request(r);
                if record.is_none() {
                    log::warn!("osmand: skipping malformed request");
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_request_decodes() {
        let mut d = OsmAndDecoder::new();
        let frame = b"POST /?id=865224&lat=-9.9&lon=-76.2&timestamp=1700000000&speed=0&bearing=0 HTTP/1.1\r\nHost: x\r\n\r\n";
        let recs = d.decode(frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        match &recs[0] {
            NormalizedRecord::Position { uniqueid, lat, lon, speed, .. } => {
                assert_eq!(uniqueid, "865224");
                assert_eq!(*lat, -9.9);
                assert_eq!(*lon, -76.2);
                assert_eq!(*speed, 0.0);
            }
            other => panic!("expected Position, got {other:?}"),
        }
    }

    #[test]
    fn two_concatenated_requests_decode_independently() {
        let mut d = OsmAndDecoder::new();
        let req = "POST /?id=865224&lat=-9.9&lon=-76.2&timestamp=1700000000&speed=0&bearing=0 HTTP/1.1\r\nHost: x\r\n\r\n";
        let frame = format!("{req}{req}");
        let recs = d.decode(frame.as_bytes(), Transport::Tcp);
        assert_eq!(recs.len(), 2);
        for r in &recs {
            match r {
                NormalizedRecord::Position { speed, .. } => assert_eq!(*speed, 0.0),
                other => panic!("expected Position, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_id_is_skipped() {
        let mut d = OsmAndDecoder::new();
        let frame = b"POST /?lat=-9.9&lon=-76.2&timestamp=1700000000 HTTP/1.1\r\n\r\n";
        assert!(d.decode(frame, Transport::Tcp).is_empty());
    }
}
