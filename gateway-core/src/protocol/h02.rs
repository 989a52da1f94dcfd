//! H02 (ASCII `*HQ,...#`-framed, plus a binary `$`-prefixed variant) decoder.
//!
//! Grounded on `original_source/src/tcp/parser/h02.py`: `process_status`'s
//! bitwise alarm decode and `decode_binary`'s fixed hex-digit field walk are
//! ported field-for-field; `decode_battery`'s non-linear table is carried
//! into `extras.battery`.

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{EventType, NormalizedRecord, Transport};
use crate::protocol::{apply_hemisphere, knots_to_kmh, parse_ddmm, Decoder};

#[derive(Debug, Default)]
pub struct H02Decoder;

impl H02Decoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_text_frame(&self, frame: &str) -> Vec<NormalizedRecord> {
        let body = frame.trim_start_matches('*').trim_end_matches('#');
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 3 {
            return vec![];
        }
        let uniqueid = fields[1].to_string();
        let cmd = fields[2];

        match cmd {
            "V1" => self.decode_v1(&uniqueid, &fields, false),
            "ALRM" => self.decode_v1(&uniqueid, &fields, true),
            "XT" | "HTBT" | "V0" => vec![NormalizedRecord::Connection {
                uniqueid,
                datetime: Utc::now(),
            }],
            "NBR" | "LINK" | "V3" | "VP1" => {
                // Cell-based location (LBS), no GPS fix: carried as Connection
                // with auxiliary data rather than a Position.
                let mut extras = Map::new();
                for (i, f) in fields.iter().enumerate().skip(3) {
                    extras.insert(format!("field_{i}"), Value::String((*f).to_string()));
                }
                vec![NormalizedRecord::Event {
                    uniqueid,
                    event_type: EventType::Unknown,
                    datetime: Utc::now(),
                    lat: None,
                    lon: None,
                    extras,
                }]
            }
            _ => vec![NormalizedRecord::Event {
                uniqueid,
                event_type: EventType::Unknown,
                datetime: Utc::now(),
                lat: None,
                lon: None,
                extras: Map::new(),
            }],
        }
    }

    fn decode_v1(&self, uniqueid: &str, fields: &[&str], is_alarm_cmd: bool) -> Vec<NormalizedRecord> {
        // fields: [*HQ, imei, V1, hhmmss, A|V, lat, NS, lon, EW, speed, course, ddmmyy, status, ...]
        if fields.len() < 12 {
            return vec![];
        }
        let time_tok = fields[3];
        let valid = fields[4] == "A";
        let Some(lat_mag) = parse_ddmm(fields[5], 2) else { return vec![] };
        let Some(ns) = fields[6].chars().next() else { return vec![] };
        let Some(lon_mag) = parse_ddmm(fields[7], 3) else { return vec![] };
        let Some(ew) = fields[8].chars().next() else { return vec![] };
        let speed_kn: f64 = fields[9].parse().unwrap_or(0.0);
        let course: f64 = fields[10].parse().unwrap_or(0.0);
        let date_tok = fields[11];

        let Some(datetime) = decode_ddmmyy_hhmmss(date_tok, time_tok) else { return vec![] };
        let lat = apply_hemisphere(lat_mag, ns);
        let lon = apply_hemisphere(lon_mag, ew);
        let speed = knots_to_kmh(speed_kn);

        let mut records = Vec::new();

        let status_hex = fields.get(12).copied();
        let status_alarm = status_hex.and_then(|h| u32::from_str_radix(h, 16).ok()).map(process_status);

        if is_alarm_cmd {
            records.push(NormalizedRecord::Event {
                uniqueid: uniqueid.to_string(),
                event_type: EventType::Alarm,
                datetime,
                lat: Some(lat),
                lon: Some(lon),
                extras: Map::new(),
            });
            return records;
        }

        records.push(NormalizedRecord::Position {
            uniqueid: uniqueid.to_string(),
            datetime,
            lat,
            lon,
            speed,
            course,
            valid,
            extras: Map::new(),
        });

        if let Some(status) = status_alarm {
            if let Some(event_type) = status.alarm_event_type {
                records.push(NormalizedRecord::Event {
                    uniqueid: uniqueid.to_string(),
                    event_type,
                    datetime,
                    lat: Some(lat),
                    lon: Some(lon),
                    extras: Map::new(),
                });
            }
        }

        records
    }

    fn decode_binary_frame(&self, data: &[u8]) -> Vec<NormalizedRecord> {
        decode_binary_frame_inner(data).unwrap_or_default()
    }
}

fn decode_binary_frame_inner(data: &[u8]) -> Option<Vec<NormalizedRecord>> {
    {
        if data.len() < 2 {
            return None;
        }
        let hex_data = hex::encode(data);
        let long_id = hex_data.len() == 84;
        if !hex_data.starts_with("24") {
            return None;
        }

        let mut pos = if long_id { 18 } else { 12 };
        let uniqueid = if long_id {
            hex_data[2..18].to_string()
        } else {
            hex_data[2..12].to_string()
        };

        let byte = |h: &str, p: usize| -> Option<u32> { h.get(p..p + 2).and_then(|s| u32::from_str_radix(s, 16).ok()) };

        let hour = byte(&hex_data, pos)?;
        pos += 2;
        let minute = byte(&hex_data, pos)?;
        pos += 2;
        let second = byte(&hex_data, pos)?;
        pos += 2;
        let day = byte(&hex_data, pos)?;
        pos += 2;
        let month = byte(&hex_data, pos)?;
        pos += 2;
        let year = byte(&hex_data, pos)? + 2000;
        pos += 2;
        let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;
        let naive = date.and_hms_opt(hour, minute, second)?;
        let datetime = Utc.from_utc_datetime(&naive);

        let mut lat_deg = byte(&hex_data, pos)? as f64 * 10.0;
        pos += 2;
        lat_deg += byte(&hex_data, pos)? as f64;
        pos += 2;

        let battery_raw = byte(&hex_data, pos)?;
        pos += 2;
        let battery_level = decode_battery(battery_raw);

        let mut lon_deg = byte(&hex_data, pos)? as f64 * 100.0;
        pos += 2;
        lon_deg += byte(&hex_data, pos)? as f64 * 10.0;
        pos += 2;
        let b3 = byte(&hex_data, pos)?;
        lon_deg += ((b3 & 0xF0) >> 4) as f64;
        let mut lon_min = (b3 & 0x0F) as f64 * 10.0;
        pos += 2;

        let flags = byte(&hex_data, pos)? & 0x0F;
        pos += 2;
        let valid = (flags & 0x02) != 0;

        let lat_min = u64::from_str_radix(hex_data.get(pos..pos + 10)?, 16).ok()? as f64 * 0.0001;
        pos += 10;
        let mut lat = lat_deg + lat_min / 60.0;
        if (flags & 0x04) == 0 {
            lat = -lat;
        }

        lon_min += u64::from_str_radix(hex_data.get(pos..pos + 8)?, 16).ok()? as f64 * 0.0001;
        pos += 8;
        let mut lon = lon_deg + lon_min / 60.0;
        if (flags & 0x08) == 0 {
            lon = -lon;
        }

        let speed_raw = u64::from_str_radix(hex_data.get(pos..pos + 6)?, 16).ok()? as f64;
        pos += 6;
        let speed = knots_to_kmh(speed_raw);

        let course_high = byte(&hex_data, pos)? & 0x0F;
        pos += 2;
        let course_low = byte(&hex_data, pos)?;
        pos += 2;
        let course = course_high as f64 * 100.0 + course_low as f64;

        let status_raw = u32::from_str_radix(hex_data.get(pos..pos + 8)?, 16).ok()?;
        let status = process_status(status_raw);

        let mut extras = Map::new();
        if let Some(b) = battery_level {
            extras.insert("battery".into(), Value::from(b));
        }
        extras.insert("ignition".into(), Value::from(status.ignition));

        let mut records = vec![NormalizedRecord::Position {
            uniqueid: uniqueid.clone(),
            datetime,
            lat,
            lon,
            speed,
            course,
            valid,
            extras,
        }];
        if let Some(event_type) = status.alarm_event_type {
            records.push(NormalizedRecord::Event {
                uniqueid,
                event_type,
                datetime,
                lat: Some(lat),
                lon: Some(lon),
                extras: Map::new(),
            });
        }
        Some(records)
    }
}

impl Decoder for H02Decoder {
    fn decode(&mut self, frame: &[u8], _transport: Transport) -> Vec<NormalizedRecord> {
        if frame.is_empty() {
            return vec![];
        }
        if frame[0] == b'$' {
            return self.decode_binary_frame(frame);
        }
        let Ok(text) = std::str::from_utf8(frame) else {
            return vec![];
        };
        text.split('#')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .flat_map(|f| self.decode_text_frame(f))
            .collect()
    }
}

struct StatusDecode {
    alarm_event_type: Option<EventType>,
    ignition: bool,
}

/// Port of `process_status`: an `elif` priority chain, so at most one alarm
/// is reported per status word, in this exact precedence order.
fn process_status(status: u32) -> StatusDecode {
    let alarm_event_type = if status & 0x1 == 0 {
        Some(EventType::Alarm)
    } else if status & 0x2 == 0 || status & 0x40000 == 0 {
        Some(EventType::Sos)
    } else if status & 0x4 == 0 {
        Some(EventType::DeviceOverspeed)
    } else if status & 0x80000 == 0 {
        Some(EventType::PowerCut)
    } else {
        None
    };
    StatusDecode {
        alarm_event_type,
        ignition: status & 0x400 != 0,
    }
}

/// Non-linear battery byte -> percentage table (`decode_battery` in the
/// original).
fn decode_battery(value: u32) -> Option<i64> {
    match value {
        0 => None,
        1..=3 => Some((value as i64 - 1) * 10),
        4..=6 => Some((value as i64 - 1) * 20),
        7..=100 => Some(value as i64),
        0xF1..=0xF6 => Some(value as i64 - 0xF0),
        _ => None,
    }
}

fn decode_ddmmyy_hhmmss(date_tok: &str, time_tok: &str) -> Option<chrono::DateTime<Utc>> {
    if date_tok.len() < 6 || time_tok.len() < 6 {
        return None;
    }
    let day: u32 = date_tok[0..2].parse().ok()?;
    let month: u32 = date_tok[2..4].parse().ok()?;
    let year: i32 = 2000 + date_tok[4..6].parse::<i32>().ok()?;
    let hour: u32 = time_tok[0..2].parse().ok()?;
    let minute: u32 = time_tok[2..4].parse().ok()?;
    let second: u32 = time_tok[4..6].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_frame_decodes_position() {
        let mut d = H02Decoder::new();
        let frame = b"*HQ,123456789012345,V1,115959,A,1203.0000,S,07702.0000,W,0.0,0.0,010124,FFFFFFBF,#";
        let recs = d.decode(frame, Transport::Tcp);
        assert!(!recs.is_empty());
        match &recs[0] {
            NormalizedRecord::Position { lat, lon, uniqueid, .. } => {
                assert_eq!(uniqueid, "123456789012345");
                assert!((*lat - (-12.05)).abs() < 1e-3);
                assert!((*lon - (-77.0333)).abs() < 1e-2);
            }
            other => panic!("expected Position, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_coordinate_within_tolerance() {
        // lat=-9.9354446 -> 09 deg 56.12668 min S; lon=-76.2398870 -> 076 deg 14.3932 min W
        let frame = b"*HQ,123456789012345,V1,000000,A,0956.1267,S,07614.3932,W,0.0,0.0,010124,FFFFFFFF,#";
        let mut d = H02Decoder::new();
        let recs = d.decode(frame, Transport::Tcp);
        let NormalizedRecord::Position { lat, lon, .. } = &recs[0] else { panic!() };
        assert!((*lat - (-9.9354446)).abs() < 1e-6 * 10.0);
        assert!((*lon - (-76.2398870)).abs() < 1e-6 * 10.0);
    }

    #[test]
    fn battery_table() {
        assert_eq!(decode_battery(0), None);
        assert_eq!(decode_battery(2), Some(10));
        assert_eq!(decode_battery(5), Some(80));
        assert_eq!(decode_battery(50), Some(50));
        assert_eq!(decode_battery(0xF3), Some(3));
    }

    #[test]
    fn status_priority_chain_reports_one_alarm() {
        // bit0 clear -> vibration regardless of other bits
        let s = process_status(0b0);
        assert!(matches!(s.alarm_event_type, Some(EventType::Alarm)));
    }

    #[test]
    fn empty_frame_yields_no_records() {
        let mut d = H02Decoder::new();
        assert!(d.decode(b"", Transport::Tcp).is_empty());
    }
}
