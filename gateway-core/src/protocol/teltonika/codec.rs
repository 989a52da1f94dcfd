//! Per-record decode for Teltonika's codec 8 / 8 extended / 16 family.
//!
//! Ported from `original_source/src/tcp/parser/teltonika.py`'s
//! `_decode_location`/`_decode_parameter`/`_init_parameter_handlers`: the
//! fixed 8/1/4/2/2/1/2-byte header layout, the per-codec event-id and IO
//! count widths, and the parameter-id -> semantic-field table with its scale
//! factors.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::model::EventType;

pub const CODEC_GH3000: u8 = 0x07;
pub const CODEC_8: u8 = 0x08;
pub const CODEC_8_EXT: u8 = 0x8E;
pub const CODEC_12: u8 = 0x0C;
pub const CODEC_13: u8 = 0x0D;
pub const CODEC_16: u8 = 0x10;

/// One decoded AVL record: the fixed fields every codec in the 8 family
/// shares, plus a semantic IO bag and the alarm IO keys that should also
/// surface as a companion `Event`.
pub struct DecodedRecord {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub lat: f64,
    pub lon: f64,
    pub altitude: i16,
    pub course: u16,
    pub satellites: u8,
    pub speed: f64,
    pub event_id: u32,
    pub io: Map<String, Value>,
    pub alarm: Option<EventType>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.offset + n;
        if end > self.data.len() {
            return Err(ParseError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read a value of the given width (1/2/4/8 bytes), as IO buckets do.
    fn value(&mut self, width: usize) -> Result<u64, ParseError> {
        match width {
            1 => Ok(self.u8()? as u64),
            2 => Ok(self.u16()? as u64),
            4 => Ok(self.u32()? as u64),
            8 => self.u64(),
            other => Err(ParseError::InvalidField {
                field: "io_width",
                reason: format!("unsupported IO value width {other}"),
            }),
        }
    }
}

/// Parameter-id -> (name, scale). Unknown ids are retained under `io_<id>`.
fn parameter_name_and_scale(id: u16) -> Option<(&'static str, f64)> {
    Some(match id {
        1 => ("din1", 1.0),
        2 => ("din2", 1.0),
        3 => ("din3", 1.0),
        4 => ("din4", 1.0),
        9 => ("adc1", 0.001),
        10 => ("adc2", 0.001),
        16 => ("odometer", 1.0),
        21 => ("rssi", 1.0),
        31 => ("engine_load", 1.0),
        32 => ("coolant_temp", 1.0),
        36 => ("rpm", 1.0),
        66 => ("power", 0.001),
        67 => ("battery", 0.001),
        72 => ("temp1", 0.1),
        73 => ("temp2", 0.1),
        74 => ("temp3", 0.1),
        75 => ("temp4", 0.1),
        81 => ("obd_speed", 1.0),
        82 => ("throttle", 1.0),
        84 => ("fuel_level", 0.1),
        85 => ("obd_rpm", 1.0),
        239 => ("ignition", 1.0),
        240 => ("movement", 1.0),
        241 => ("operator", 1.0),
        246 => ("tow_alarm", 1.0),
        247 => ("crash_alarm", 1.0),
        249 => ("jamming_alarm", 1.0),
        251 => ("idle_alarm", 1.0),
        252 => ("power_cut_alarm", 1.0),
        253 => ("harsh_behavior", 1.0),
        _ => return None,
    })
}

fn alarm_event_type(io_name: &str) -> Option<EventType> {
    match io_name {
        "tow_alarm" | "jamming_alarm" | "idle_alarm" | "harsh_behavior" => Some(EventType::Alarm),
        "crash_alarm" => Some(EventType::AccidentAlarm),
        "power_cut_alarm" => Some(EventType::PowerCut),
        _ => None,
    }
}

fn decode_parameter(io: &mut Map<String, Value>, id: u16, raw: u64) -> Option<EventType> {
    match parameter_name_and_scale(id) {
        Some((name, scale)) => {
            let is_flag = matches!(
                name,
                "din1" | "din2" | "din3" | "din4" | "ignition" | "movement"
            );
            let value = if is_flag {
                Value::Bool(raw > 0)
            } else if scale != 1.0 {
                Value::from(raw as f64 * scale)
            } else {
                Value::from(raw)
            };
            let is_alarm = name.ends_with("_alarm") || name == "harsh_behavior";
            let triggered = raw > 0;
            io.insert(name.to_string(), value);
            if is_alarm && triggered {
                alarm_event_type(name)
            } else {
                None
            }
        }
        None => {
            io.insert(format!("io_{id}"), Value::from(raw));
            None
        }
    }
}

/// Decode one AVL record for codec 8 / 8 extended / 16 (the "standard"
/// branch of `_decode_location`). GH3000 (codec 0x07) uses a different,
/// float-based wire layout and is handled by `decode_gh3000_record`.
pub fn decode_standard_record(data: &[u8], codec: u8) -> Result<(DecodedRecord, usize), ParseError> {
    let mut c = Cursor::new(data);

    let ts_ms = c.u64()?;
    let timestamp = Utc
        .timestamp_millis_opt(ts_ms as i64)
        .single()
        .ok_or(ParseError::InvalidField {
            field: "timestamp",
            reason: "out of range".into(),
        })?;
    let priority = c.u8()?;
    let lon = (c.u32()? as i32) as f64 / 1e7;
    let lat = (c.u32()? as i32) as f64 / 1e7;
    let altitude = c.u16()? as i16;
    let course = c.u16()?;
    let satellites = c.u8()?;
    let speed_raw = c.u16()?;

    let event_id = if codec == CODEC_8_EXT || codec == CODEC_16 {
        c.u16()? as u32
    } else {
        c.u8()? as u32
    };
    if codec == CODEC_16 {
        let _generation_type = c.u8()?;
    }

    let _total_io = if codec == CODEC_8_EXT { c.u16()? as u32 } else { c.u8()? as u32 };

    let mut io = Map::new();
    let mut alarm = None;
    let id_width = if codec == CODEC_8_EXT || codec == CODEC_16 { 2 } else { 1 };
    let count_width = if codec == CODEC_8_EXT { 2 } else { 1 };

    for value_width in [1usize, 2, 4, 8] {
        if value_width == 8 && !matches!(codec, CODEC_8 | CODEC_8_EXT | CODEC_16) {
            continue;
        }
        let count = if count_width == 2 { c.u16()? as u32 } else { c.u8()? as u32 };
        for _ in 0..count {
            let id = if id_width == 2 { c.u16()? } else { c.u8()? as u16 };
            let value = c.value(value_width)?;
            if let Some(ev) = decode_parameter(&mut io, id, value) {
                alarm = Some(ev);
            }
        }
    }

    Ok((
        DecodedRecord {
            timestamp,
            priority,
            lat,
            lon,
            altitude,
            course,
            satellites,
            // Already km/h in this codec family (spec scenario 4), unlike
            // GPS103/H02's knots.
            speed: speed_raw as f64,
            event_id,
            io,
            alarm,
        },
        c.offset,
    ))
}

/// Decode one GH3000-codec (0x07) record: a legacy, more compact layout
/// (4-byte epoch-since-2007 timestamp, float coordinates, byte-scaled
/// course/speed) that predates the codec-8 family.
pub fn decode_gh3000_record(data: &[u8]) -> Result<(DecodedRecord, usize), ParseError> {
    const GH3000_EPOCH_OFFSET_SECS: i64 = 1_167_609_600; // 2007-01-01T00:00:00Z

    let mut c = Cursor::new(data);
    let raw_ts = c.u32()? & 0x3FFF_FFFF;
    let timestamp = Utc
        .timestamp_opt(raw_ts as i64 + GH3000_EPOCH_OFFSET_SECS, 0)
        .single()
        .ok_or(ParseError::InvalidField {
            field: "timestamp",
            reason: "out of range".into(),
        })?;

    let global_mask = c.u8()?;
    let mut lat = 0.0;
    let mut lon = 0.0;
    let mut altitude = 0i16;
    let mut course = 0u16;
    let mut satellites = 0u8;
    let mut speed = 0.0;

    if global_mask & 0x01 != 0 {
        let location_mask = c.u8()?;
        if location_mask & 0x01 != 0 {
            lat = f32::from_be_bytes(c.take(4)?.try_into().unwrap()) as f64;
            lon = f32::from_be_bytes(c.take(4)?.try_into().unwrap()) as f64;
        }
        if location_mask & 0x02 != 0 {
            altitude = c.u16()? as i16;
        }
        if location_mask & 0x04 != 0 {
            course = (c.u8()? as f64 * 360.0 / 256.0) as u16;
        }
        if location_mask & 0x08 != 0 {
            speed = c.u8()? as f64 * 1.852;
        }
        if location_mask & 0x10 != 0 {
            satellites = c.u8()?;
        }
    }

    Ok((
        DecodedRecord {
            timestamp,
            priority: 0,
            lat,
            lon,
            altitude,
            course,
            satellites,
            speed,
            event_id: 0,
            io: Map::new(),
            alarm: None,
        },
        c.offset,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_codec8_record() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&0u64.to_be_bytes()); // timestamp placeholder, overwritten below
        b
    }

    #[test]
    fn decode_parameter_unknown_id_falls_back_to_generic_key() {
        let mut io = Map::new();
        let ev = decode_parameter(&mut io, 9999, 42);
        assert!(ev.is_none());
        assert_eq!(io.get("io_9999"), Some(&Value::from(42)));
    }

    #[test]
    fn decode_parameter_scales_battery() {
        let mut io = Map::new();
        decode_parameter(&mut io, 67, 12000);
        assert_eq!(io.get("battery"), Some(&Value::from(12.0)));
    }

    #[test]
    fn decode_parameter_crash_alarm_maps_to_accident() {
        let mut io = Map::new();
        let ev = decode_parameter(&mut io, 247, 1);
        assert_eq!(ev, Some(EventType::AccidentAlarm));
    }

    #[test]
    fn too_short_buffer_errors() {
        let data = sample_codec8_record();
        let data = &data[..4];
        assert!(decode_standard_record(data, CODEC_8).is_err());
    }
}
