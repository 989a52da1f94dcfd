//! Teltonika binary protocol (TCP identification + AVL, UDP datagram).
//!
//! Grounded on `original_source/src/tcp/parser/teltonika.py`'s
//! `decode_tcp_packet`/`decode_udp_packet`: TCP frames start with a 2-byte
//! length-prefixed IMEI identification, subsequent frames carry a 4-byte
//! zero preamble, 4-byte data length, codec, record count, records, a
//! trailing record-count repeat and CRC; UDP frames are self-contained with
//! their own header.

pub mod codec;

use serde_json::Map;

use crate::model::{NormalizedRecord, Transport};
use crate::protocol::Decoder;

use codec::{decode_gh3000_record, decode_standard_record, DecodedRecord, CODEC_GH3000};

/// Stateful per-connection decoder: carries the IMEI learned from the TCP
/// identification frame forward, since every AVL frame that follows on the
/// same connection carries no IMEI of its own.
#[derive(Debug, Default)]
pub struct TeltonikaDecoder {
    tcp_imei: Option<String>,
}

impl TeltonikaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_tcp(&mut self, data: &[u8]) -> Vec<NormalizedRecord> {
        if data.len() >= 2 {
            let imei_len = u16::from_be_bytes([data[0], data[1]]) as usize;
            if imei_len > 0 && imei_len < data.len() {
                if let Ok(imei) = std::str::from_utf8(&data[2..2 + imei_len]) {
                    self.tcp_imei = Some(imei.to_string());
                    return vec![NormalizedRecord::Connection {
                        uniqueid: imei.to_string(),
                        datetime: chrono::Utc::now(),
                    }];
                }
            }
        }

        if data.len() < 9 {
            return vec![];
        }
        let Some(imei) = self.tcp_imei.as_deref() else {
            log::warn!("teltonika: AVL frame received before identification, dropping");
            return vec![];
        };
        let data_length = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
        let codec = data[8];
        // [4B preamble][4B data_length][codec][record_count][records...][record_count][4B CRC]
        let expected_total = 4 + 4 + data_length + 4;
        if data.len() < expected_total {
            log::warn!(
                "teltonika: data_length mismatch, declared {data_length}, have {} bytes; rejecting batch",
                data.len() - 8
            );
            return vec![];
        }

        let record_count = data[9];
        decode_records(&data[10..], codec, record_count as usize, imei)
    }

    fn decode_udp(&self, data: &[u8]) -> Vec<NormalizedRecord> {
        if data.len() < 10 {
            return vec![];
        }
        let mut offset = 2; // length
        offset += 2; // packet id
        offset += 1; // packet type
        offset += 1; // location packet id
        let imei_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;
        if offset + imei_len + 2 > data.len() {
            return vec![];
        }
        let Ok(imei) = std::str::from_utf8(&data[offset..offset + imei_len]) else {
            return vec![];
        };
        offset += imei_len;
        let codec = data[offset];
        offset += 1;
        let record_count = data[offset];
        offset += 1;

        decode_records(&data[offset..], codec, record_count as usize, imei)
    }
}

fn decode_records(mut rest: &[u8], codec: u8, record_count: usize, forced_uniqueid: &str) -> Vec<NormalizedRecord> {
    let mut out = Vec::new();
    for _ in 0..record_count {
        let decoded = if codec == CODEC_GH3000 {
            decode_gh3000_record(rest)
        } else {
            decode_standard_record(rest, codec)
        };
        let (record, consumed) = match decoded {
            Ok(v) => v,
            Err(e) => {
                log::warn!("teltonika: stopping record decode early: {e}");
                break;
            }
        };
        rest = &rest[consumed..];
        push_records(&mut out, record, forced_uniqueid);
    }
    out
}

fn push_records(out: &mut Vec<NormalizedRecord>, record: DecodedRecord, forced_uniqueid: &str) {
    let uniqueid = forced_uniqueid.to_string();
    let mut extras = record.io;
    extras.insert("altitude".into(), record.altitude.into());
    extras.insert("satellites".into(), record.satellites.into());
    extras.insert("priority".into(), record.priority.into());
    extras.insert("event_id".into(), record.event_id.into());

    out.push(NormalizedRecord::Position {
        uniqueid: uniqueid.clone(),
        datetime: record.timestamp,
        lat: record.lat,
        lon: record.lon,
        speed: record.speed,
        course: record.course as f64,
        valid: record.satellites > 0,
        extras,
    });

    if let Some(event_type) = record.alarm {
        out.push(NormalizedRecord::Event {
            uniqueid,
            event_type,
            datetime: record.timestamp,
            lat: Some(record.lat),
            lon: Some(record.lon),
            extras: Map::new(),
        });
    }
}

impl Decoder for TeltonikaDecoder {
    fn decode(&mut self, frame: &[u8], transport: Transport) -> Vec<NormalizedRecord> {
        if frame.is_empty() {
            return vec![];
        }
        match transport {
            Transport::Tcp => self.decode_tcp(frame),
            Transport::Udp => self.decode_udp(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_frame_is_connection() {
        let mut d = TeltonikaDecoder::new();
        let imei = "353451044508750";
        let mut frame = (imei.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(imei.as_bytes());
        let recs = d.decode(&frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        assert!(matches!(&recs[0], NormalizedRecord::Connection { uniqueid, .. } if uniqueid == imei));
    }

    fn build_codec8_avl(lat: f64, lon: f64, speed: u16) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&0u64.to_be_bytes()); // timestamp ms (epoch 0, valid but arbitrary)
        record.push(1); // priority
        record.extend_from_slice(&((lon * 1e7) as i32).to_be_bytes());
        record.extend_from_slice(&((lat * 1e7) as i32).to_be_bytes());
        record.extend_from_slice(&0i16.to_be_bytes()); // altitude
        record.extend_from_slice(&0u16.to_be_bytes()); // course
        record.push(5); // satellites
        record.extend_from_slice(&speed.to_be_bytes());
        record.push(0); // event id (codec 8: 1 byte)
        record.push(0); // total io count (codec 8: 1 byte)
        record.push(0); // 1-byte io count
        record.push(0); // 2-byte io count
        record.push(0); // 4-byte io count
        record.push(0); // 8-byte io count

        let mut avl = Vec::new();
        avl.extend_from_slice(&[0, 0, 0, 0]); // preamble
        let body_len = (1 + 1 + record.len() + 1) as u32; // codec + record_count + record + record_count
        avl.extend_from_slice(&body_len.to_be_bytes());
        avl.push(0x08); // codec 8
        avl.push(1); // record count
        avl.extend_from_slice(&record);
        avl.push(1); // record count repeat
        avl.extend_from_slice(&[0, 0, 0, 0]); // crc

        avl
    }

    fn identify(d: &mut TeltonikaDecoder, imei: &str) {
        let mut frame = (imei.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(imei.as_bytes());
        let recs = d.decode(&frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn codec8_avl_frame_decodes_position() {
        let mut d = TeltonikaDecoder::new();
        let imei = "353451044508750";
        identify(&mut d, imei);
        let frame = build_codec8_avl(-9.9, -76.2, 60);
        let recs = d.decode(&frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        match &recs[0] {
            NormalizedRecord::Position { uniqueid, lat, lon, speed, .. } => {
                assert_eq!(uniqueid, imei);
                assert!((*lat - (-9.9)).abs() < 1e-6);
                assert!((*lon - (-76.2)).abs() < 1e-6);
                assert_eq!(*speed, 60.0);
            }
            other => panic!("expected Position, got {other:?}"),
        }
    }

    #[test]
    fn avl_frame_before_identification_is_dropped() {
        let mut d = TeltonikaDecoder::new();
        let frame = build_codec8_avl(-9.9, -76.2, 60);
        assert!(d.decode(&frame, Transport::Tcp).is_empty());
    }

    #[test]
    fn length_mismatch_rejects_batch_without_poisoning() {
        let mut d = TeltonikaDecoder::new();
        identify(&mut d, "353451044508750");
        let mut frame = build_codec8_avl(-9.9, -76.2, 60);
        frame.truncate(frame.len() - 5);
        assert!(d.decode(&frame, Transport::Tcp).is_empty());
        // decoder instance is still usable afterwards
        let good = build_codec8_avl(1.0, 2.0, 10);
        assert_eq!(d.decode(&good, Transport::Tcp).len(), 1);
    }
}
