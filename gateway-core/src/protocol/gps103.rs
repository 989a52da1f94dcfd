//! GPS103 (ASCII, `;`-terminated) decoder.
//!
//! Grounded on `original_source/src/tcp/parser/gps103.py`: the canonical
//! command-table frame plus two variant sentences (OBD telemetry, the
//! compact `*`-terminated alternate) and photo-packet accumulation.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{EventType, NormalizedRecord, Transport};
use crate::protocol::{apply_hemisphere, knots_to_kmh, parse_ddmm, Decoder};

/// The source assumes device clocks run 5 hours ahead of UTC. Canonicalized
/// to UTC at decode time; kept as a named constant so a deployment can
/// override it rather than have the offset silently baked in.
pub const GPS103_TZ_OFFSET_HOURS: i64 = 5;

/// Stateful per-connection decoder: carries the in-progress photo buffer
/// across frames, as the original's `Gps103Decoder` instance does.
#[derive(Debug, Default)]
pub struct Gps103Decoder {
    photo_packets_expected: u32,
    photo_data: Vec<u8>,
}

impl Gps103Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_frame(&mut self, frame: &str) -> Vec<NormalizedRecord> {
        let frame = frame.trim();
        if frame.is_empty() {
            return vec![];
        }

        // Bare-IMEI handshake: all digits, no `imei:` prefix.
        if frame.chars().all(|c| c.is_ascii_digit()) {
            return vec![NormalizedRecord::Connection {
                uniqueid: frame.to_string(),
                datetime: Utc::now(),
            }];
        }

        let Some(rest) = frame.strip_prefix("imei:") else {
            return vec![];
        };

        if let Some((uniqueid, tail)) = rest.split_once(',') {
            if tail.starts_with("vr") || tail.starts_with("VR") {
                return self.decode_photo(uniqueid, tail);
            }
            if let Some(obd_tail) = tail.strip_prefix("OBD,") {
                return self
                    .decode_obd(uniqueid, obd_tail)
                    .into_iter()
                    .collect();
            }
            if frame.ends_with('*') {
                return self
                    .decode_alternative(uniqueid, tail.trim_end_matches('*'))
                    .into_iter()
                    .collect();
            }
            return self.decode_regular(uniqueid, tail).into_iter().collect();
        }

        vec![]
    }

    fn decode_regular(&self, uniqueid: &str, tail: &str) -> Option<NormalizedRecord> {
        let fields: Vec<&str> = tail.split(',').collect();
        if fields.is_empty() {
            return None;
        }
        let cmd = fields[0];

        // Bare connection handshake, no further fields.
        if fields.len() < 2 {
            return Some(NormalizedRecord::Connection {
                uniqueid: uniqueid.to_string(),
                datetime: Utc::now(),
            });
        }

        let cmd_datetime = fields.get(1).copied().unwrap_or("");

        // Find the validity flag ("A" or "V") to locate the coordinate block.
        let validity_idx = fields
            .iter()
            .position(|f| *f == "A" || *f == "V")?;
        let valid = fields[validity_idx] == "A";

        let lat_raw = fields.get(validity_idx + 1).copied()?;
        let ns = fields.get(validity_idx + 2).copied()?.chars().next()?;
        let lon_raw = fields.get(validity_idx + 3).copied()?;
        let ew = fields.get(validity_idx + 4).copied()?.chars().next()?;
        let speed_kn: f64 = fields.get(validity_idx + 5).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let course: f64 = fields.get(validity_idx + 6).and_then(|s| s.parse().ok()).unwrap_or(0.0);

        let lat = apply_hemisphere(parse_ddmm(lat_raw, 2)?, ns);
        let lon = apply_hemisphere(parse_ddmm(lon_raw, 3)?, ew);

        // Prefer the precise UTC hh:mm:ss token that precedes the validity
        // flag (the original's "hora utc" group) when present; otherwise
        // fall back to the command datetime with the fixed offset applied.
        let utc_time_token = fields.get(validity_idx.saturating_sub(1)).copied();
        let datetime = decode_datetime(cmd_datetime, utc_time_token)?;

        let mut extras = Map::new();
        for (i, extra) in fields.iter().enumerate().skip(validity_idx + 7) {
            extras.insert(format!("field_{i}"), Value::String(extra.to_string()));
        }

        if let Some(event_type) = alarm_event_type(cmd) {
            if let Some(payload) = alarm_payload(cmd) {
                extras.insert("payload".to_string(), Value::String(payload));
            }
            return Some(NormalizedRecord::Event {
                uniqueid: uniqueid.to_string(),
                event_type,
                datetime,
                lat: Some(lat),
                lon: Some(lon),
                extras,
            });
        }

        Some(NormalizedRecord::Position {
            uniqueid: uniqueid.to_string(),
            datetime,
            lat,
            lon,
            speed: knots_to_kmh(speed_kn),
            course,
            valid,
            extras,
        })
    }

    /// `original_source` `decode_obd`: engine telemetry, no position.
    fn decode_obd(&self, uniqueid: &str, tail: &str) -> Option<NormalizedRecord> {
        let fields: Vec<&str> = tail.split(',').collect();
        if fields.len() < 13 {
            return None;
        }
        let datetime = decode_datetime(fields[0], None)?;

        let mut extras = Map::new();
        if let Some(v) = fields.get(1).filter(|s| !s.is_empty()) {
            extras.insert("odometer".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(3).filter(|s| !s.is_empty()) {
            extras.insert("fuelConsumption".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(4).filter(|s| !s.is_empty()) {
            extras.insert("hours".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(5).filter(|s| !s.is_empty()) {
            extras.insert("obdSpeed".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(7).filter(|s| !s.is_empty()) {
            extras.insert("coolantTemp".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(9).filter(|s| !s.is_empty()) {
            extras.insert("rpm".into(), Value::String((*v).to_string()));
        }
        if let Some(v) = fields.get(11).filter(|s| !s.is_empty()) {
            extras.insert("dtcs".into(), Value::String((*v).to_string()));
        }

        Some(NormalizedRecord::Event {
            uniqueid: uniqueid.to_string(),
            event_type: EventType::Fault,
            datetime,
            lat: None,
            lon: None,
            extras,
        })
    }

    /// `original_source` `decode_alternative`: compact sentence with raw
    /// decimal-degree coordinates instead of DDMM.mmmm, terminated by `*`.
    fn decode_alternative(&self, uniqueid: &str, tail: &str) -> Option<NormalizedRecord> {
        let fields: Vec<&str> = tail.split(',').collect();
        if fields.len() < 16 {
            return None;
        }
        // fields: event,sensor,voltage,HHMMSS(3),DDMMYY(3),rssi,valid,lat,lon,
        //         speed_kmh,course,altitude,hdop,satellites,ignition,charge,[error]
        let hh: u32 = fields[3].parse().ok()?;
        let mm: u32 = fields[4].parse().ok()?;
        let ss: u32 = fields[5].parse().ok()?;
        let day: u32 = fields[6].parse().ok()?;
        let month: u32 = fields[7].parse().ok()?;
        let year: i32 = 2000 + fields[8].parse::<i32>().ok()?;
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let naive = date.and_hms_opt(hh, mm, ss)?;
        let datetime = Utc.from_utc_datetime(&naive);

        let valid = fields[10].parse::<i32>().unwrap_or(0) > 0;
        let lat: f64 = fields[11].parse().ok()?;
        let lon: f64 = fields[12].parse().ok()?;
        let speed_kmh: f64 = fields[13].parse().unwrap_or(0.0);
        let course: f64 = fields[14].parse().unwrap_or(0.0);

        let mut extras = Map::new();
        if let Ok(rssi) = fields[9].parse::<i64>() {
            extras.insert("rssi".into(), Value::from(rssi));
        }
        if let Some(hdop) = fields.get(16).and_then(|s| s.parse::<f64>().ok()) {
            extras.insert("hdop".into(), Value::from(hdop));
        }
        if let Some(sats) = fields.get(17).and_then(|s| s.parse::<i64>().ok()) {
            extras.insert("satellites".into(), Value::from(sats));
        }

        Some(NormalizedRecord::Position {
            uniqueid: uniqueid.to_string(),
            datetime,
            lat,
            lon,
            speed: speed_kmh,
            course,
            valid,
            extras,
        })
    }

    /// Photo subframes (`vr*`, hex payload) accumulate until the declared
    /// packet count is reached, then emit a single Event carrying the image.
    fn decode_photo(&mut self, uniqueid: &str, tail: &str) -> Vec<NormalizedRecord> {
        let mut fields = tail.split(',');
        let Some(cmd) = fields.next() else {
            return vec![];
        };
        // `vr<n>` marks the start of a new photo; following frames carry hex chunks.
        if let Some(count_str) = cmd.strip_prefix("vr").or_else(|| cmd.strip_prefix("VR")) {
            if let Ok(count) = count_str.parse::<u32>() {
                self.photo_packets_expected = count;
                self.photo_data.clear();
                return vec![];
            }
        }

        let Some(hex_payload) = fields.next() else {
            self.reset_photo();
            return vec![];
        };
        let Ok(bytes) = hex::decode(hex_payload.trim()) else {
            self.reset_photo();
            return vec![];
        };
        if bytes.len() < 6 {
            self.reset_photo();
            return vec![];
        }
        let index = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
        self.photo_data.extend_from_slice(&bytes[4..bytes.len() - 2]);

        if index + 1 >= self.photo_packets_expected {
            let mut extras = Map::new();
            extras.insert(
                "image".to_string(),
                Value::String(hex::encode(&self.photo_data)),
            );
            self.reset_photo();
            return vec![NormalizedRecord::Event {
                uniqueid: uniqueid.to_string(),
                event_type: EventType::Unknown,
                datetime: Utc::now(),
                lat: None,
                lon: None,
                extras,
            }];
        }
        vec![]
    }

    fn reset_photo(&mut self) {
        self.photo_packets_expected = 0;
        self.photo_data.clear();
    }
}

impl Decoder for Gps103Decoder {
    fn decode(&mut self, frame: &[u8], _transport: Transport) -> Vec<NormalizedRecord> {
        let Ok(text) = std::str::from_utf8(frame) else {
            return vec![];
        };
        text.split(';')
            .filter(|f| !f.is_empty())
            .flat_map(|f| self.decode_frame(f))
            .collect()
    }
}

fn decode_datetime(cmd_datetime: &str, utc_time_token: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    let digits: Vec<char> = cmd_datetime.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 10 {
        return None;
    }
    let s: String = digits.into_iter().collect();
    let year = 2000 + s[0..2].parse::<i32>().ok()?;
    let month: u32 = s[2..4].parse().ok()?;
    let day: u32 = s[4..6].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;

    if let Some(tok) = utc_time_token {
        let t: Vec<char> = tok.chars().filter(|c| c.is_ascii_digit()).collect();
        if t.len() >= 6 {
            let ts: String = t.into_iter().collect();
            let hh: u32 = ts[0..2].parse().ok()?;
            let mm: u32 = ts[2..4].parse().ok()?;
            let ss: u32 = ts[4..6].parse().ok()?;
            let naive = date.and_hms_opt(hh, mm, ss)?;
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    let hour: u32 = s[6..8].parse().ok()?;
    let minute: u32 = s[8..10].parse().ok()?;
    let second: u32 = if s.len() >= 12 { s[10..12].parse().ok()? } else { 0 };
    let naive = date.and_hms_opt(hour, minute, second)?;
    let local = Utc.from_utc_datetime(&naive);
    Some(local - Duration::hours(GPS103_TZ_OFFSET_HOURS))
}

fn alarm_event_type(cmd: &str) -> Option<EventType> {
    if cmd.starts_with("T:") {
        return Some(EventType::Temperature);
    }
    if cmd.starts_with("DTC") {
        return Some(EventType::Fault);
    }
    if cmd == "oil" || cmd == "oil1" || cmd == "oil2" {
        return Some(EventType::FuelLeak);
    }
    match cmd {
        "help me" => Some(EventType::Sos),
        "low battery" => Some(EventType::LowBattery),
        "move" => Some(EventType::DeviceMoving),
        "speed" => Some(EventType::DeviceOverspeed),
        "stockade" => Some(EventType::GeofenceAlarm),
        "ac alarm" => Some(EventType::PowerCut),
        "acc on" => Some(EventType::IgnitionOn),
        "acc off" => Some(EventType::IgnitionOff),
        "sensor alarm" => Some(EventType::Alarm),
        "door alarm" => Some(EventType::DoorAlarm),
        "bonnet alarm" => Some(EventType::BonnetAlarm),
        "footbrake alarm" => Some(EventType::FootBrakeAlarm),
        "accident alarm" => Some(EventType::AccidentAlarm),
        "TPMS" => Some(EventType::Tpms),
        "rfid" => Some(EventType::Rfid),
        _ => None,
    }
}

fn alarm_payload(cmd: &str) -> Option<String> {
    if let Some(temp) = cmd.strip_prefix("T:") {
        return Some(temp.to_string());
    }
    if let Some(code) = cmd.strip_prefix("DTC") {
        return Some(code.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_imei_is_connection() {
        let mut d = Gps103Decoder::new();
        let recs = d.decode(b"353451044508750;", Transport::Tcp);
        assert_eq!(recs.len(), 1);
        assert!(matches!(recs[0], NormalizedRecord::Connection { .. }));
    }

    #[test]
    fn tracker_frame_is_position() {
        let mut d = Gps103Decoder::new();
        let frame = b"imei:353451044508750,tracker,240101120005,,F,120005.000,A,1202.4000,S,07701.8000,W,10.0,90.0;";
        let recs = d.decode(frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        match &recs[0] {
            NormalizedRecord::Position { lat, lon, speed, uniqueid, valid, .. } => {
                assert_eq!(uniqueid, "353451044508750");
                assert!(*valid);
                assert!((*lat - (-12.04)).abs() < 1e-3);
                assert!((*lon - (-77.03)).abs() < 1e-3);
                assert!((*speed - 18.52).abs() < 1e-6);
            }
            other => panic!("expected Position, got {other:?}"),
        }
    }

    #[test]
    fn help_me_is_sos_event() {
        let mut d = Gps103Decoder::new();
        let frame = b"imei:353451044508750,help me,240101120005,,F,120005.000,A,1202.4000,S,07701.8000,W,10.0,90.0;";
        let recs = d.decode(frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        assert!(matches!(
            &recs[0],
            NormalizedRecord::Event { event_type: EventType::Sos, .. }
        ));
    }

    #[test]
    fn empty_buffer_yields_no_records() {
        let mut d = Gps103Decoder::new();
        assert!(d.decode(b"", Transport::Tcp).is_empty());
    }

    #[test]
    fn single_separator_yields_no_records() {
        let mut d = Gps103Decoder::new();
        assert!(d.decode(b";", Transport::Tcp).is_empty());
    }

    #[test]
    fn malformed_prefix_then_valid_frame_emits_only_the_valid_one() {
        let mut d = Gps103Decoder::new();
        let frame = b"garbage-not-a-frame;353451044508750;";
        let recs = d.decode(frame, Transport::Tcp);
        assert_eq!(recs.len(), 1);
        assert!(matches!(recs[0], NormalizedRecord::Connection { .. }));
    }

    #[test]
    fn decoder_is_idempotent() {
        let frame: &[u8] = b"imei:353451044508750,tracker,240101120005,,F,120005.000,A,1202.4000,S,07701.8000,W,10.0,90.0;";
        let mut d1 = Gps103Decoder::new();
        let mut d2 = Gps103Decoder::new();
        let a = d1.decode(frame, Transport::Tcp);
        let b = d2.decode(frame, Transport::Tcp);
        assert_eq!(a.len(), b.len());
    }
}
