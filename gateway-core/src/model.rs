//! Domain model shared by every protocol decoder and by the server crate.
//!
//! Nothing here touches I/O; `Device` and `NormalizedRecord` are plain data,
//! serializable as-is onto the WebSocket wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transport a frame arrived on. Some decoders vary field widths by transport
/// (Teltonika UDP has no CRC trailer, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Online/offline classification driven by the liveness loop (C10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Unknown
    }
}

/// The long-lived identity of a tracked object.
///
/// `id` and `uniqueid` are both unique within the registry. The whitelisted
/// field set commented on each field below is exactly what `mergeSelective`
/// (registry C3) is permitted to overwrite on an existing device; `id` and
/// `uniqueid` themselves are never rewritten by a merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub uniqueid: String,
    pub name: String,

    // --- mergeSelective whitelist ---
    pub positionid: Option<i64>,
    pub groupid: Option<i64>,
    pub attributes: Option<Value>,
    pub phone: Option<String>,
    pub model: Option<String>,
    pub contact: Option<String>,
    pub category: Option<String>,
    pub icon: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub course: f64,
    pub speed: f64,
    pub driver: Option<String>,
    pub contactos: Vec<String>,
    // --- end whitelist ---
    pub lastupdate: Option<DateTime<Utc>>,
    pub laststop: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
}

impl Device {
    /// A bare device as returned by the admin API's `alldevices-info`, before
    /// any position has ever been applied to it.
    pub fn new(id: i64, uniqueid: impl Into<String>, name: impl Into<String>) -> Self {
        Device {
            id,
            uniqueid: uniqueid.into(),
            name: name.into(),
            positionid: None,
            groupid: None,
            attributes: None,
            phone: None,
            model: None,
            contact: None,
            category: None,
            icon: None,
            latitude: 0.0,
            longitude: 0.0,
            course: 0.0,
            speed: 0.0,
            driver: None,
            contactos: Vec::new(),
            lastupdate: None,
            laststop: None,
            status: DeviceStatus::Unknown,
        }
    }

    /// Overwrite only the whitelisted fields from `other`, as `mergeSelective`
    /// requires. `id` is assumed equal by the caller; `uniqueid`
    /// and `name` are deliberately excluded from the whitelist.
    pub fn merge_selective(&mut self, other: &Device) {
        self.positionid = other.positionid;
        self.groupid = other.groupid;
        self.attributes = other.attributes.clone();
        self.phone = other.phone.clone();
        self.model = other.model.clone();
        self.contact = other.contact.clone();
        self.category = other.category.clone();
        self.icon = other.icon.clone();
        self.latitude = other.latitude;
        self.longitude = other.longitude;
        self.course = other.course;
        self.speed = other.speed;
        self.driver = other.driver.clone();
        self.contactos = other.contactos.clone();
    }
}

/// The canonical event-type vocabulary. Unrecognized vendor
/// commands decode to `Unknown` and are dropped before notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Position,
    IgnitionOn,
    IgnitionOff,
    Sos,
    LowBattery,
    DeviceMoving,
    DeviceOverspeed,
    GeofenceAlarm,
    GeofenceEnter,
    GeofenceExit,
    PowerCut,
    Alarm,
    AccidentAlarm,
    BonnetAlarm,
    FootBrakeAlarm,
    DoorAlarm,
    DeviceOffline,
    Fault,
    FuelLeak,
    Temperature,
    #[serde(rename = "TPMS")]
    Tpms,
    #[serde(rename = "RFID")]
    Rfid,
    Unknown,
}

impl EventType {
    /// Events that additionally fan out to WhatsApp.
    pub fn notifies_whatsapp(&self) -> bool {
        matches!(
            self,
            EventType::PowerCut
                | EventType::LowBattery
                | EventType::Sos
                | EventType::GeofenceEnter
                | EventType::GeofenceExit
        )
    }
}

/// The discriminated output of any decoder.
///
/// Replaces the ad-hoc `{"type": "...", "data": {...}}` shape the original
/// protocol handlers used: dispatch on this enum is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NormalizedRecord {
    Connection {
        uniqueid: String,
        datetime: DateTime<Utc>,
    },
    Position {
        uniqueid: String,
        datetime: DateTime<Utc>,
        lat: f64,
        lon: f64,
        /// km/h
        speed: f64,
        /// degrees
        course: f64,
        valid: bool,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        extras: Map<String, Value>,
    },
    Event {
        uniqueid: String,
        event_type: EventType,
        datetime: DateTime<Utc>,
        lat: Option<f64>,
        lon: Option<f64>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        extras: Map<String, Value>,
    },
}

impl NormalizedRecord {
    pub fn uniqueid(&self) -> &str {
        match self {
            NormalizedRecord::Connection { uniqueid, .. } => uniqueid,
            NormalizedRecord::Position { uniqueid, .. } => uniqueid,
            NormalizedRecord::Event { uniqueid, .. } => uniqueid,
        }
    }
}

/// A named spatial region bound to one or more devices. Immutable once
/// loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: i64,
    pub name: String,
    pub shape: GeofenceShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum GeofenceShape {
    /// Vertices in `(lat, lon)` order, matching the relational store's
    /// non-standard `POLYGON ((lat lon, …))` text — not WKT's `(lon, lat)`
    /// order.
    Polygon { vertices: Vec<(f64, f64)>, closed: bool },
    Circle { center: (f64, f64), radius_m: f64 },
}

/// A time-limited bearer capability restricted to one device, handed out
/// for share links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestToken {
    pub token: String,
    pub device_id: i64,
    pub expires_at: DateTime<Utc>,
}

impl GuestToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_selective_preserves_identity_fields() {
        let mut d = Device::new(1, "imei-1", "Truck 1");
        d.latitude = 1.0;
        let mut incoming = Device::new(1, "should-not-overwrite", "should-not-overwrite");
        incoming.latitude = 2.0;
        incoming.speed = 30.0;
        d.merge_selective(&incoming);
        assert_eq!(d.uniqueid, "imei-1");
        assert_eq!(d.name, "Truck 1");
        assert_eq!(d.latitude, 2.0);
        assert_eq!(d.speed, 30.0);
    }

    #[test]
    fn guest_token_expiry() {
        let now = Utc::now();
        let tok = GuestToken {
            token: "abc".into(),
            device_id: 1,
            expires_at: now,
        };
        assert!(tok.is_expired(now));
        assert!(!tok.is_expired(now - chrono::Duration::seconds(1)));
    }
}
