//! Event Engine (C5): the single point every alarm — decoded from a wire
//! frame, derived from a geofence crossing, or synthesized by the liveness
//! loop or the SOS endpoint — passes through on its way to subscribers.
//!
//! Grounded on `mayara-server/src/radar/mod.rs`'s fan-out-on-change pattern
//! (a state change produces one `RadarMessage` broadcast to every
//! subscriber); here the broadcast targets are resolved per-device from the
//! admin API rather than a single `tokio::sync::broadcast` channel, since
//! recipients vary per event rather than being every connected client.

use chrono::{DateTime, Utc};
use serde::Serialize;

use gateway_core::EventType;

use crate::error::GatewayError;
use crate::external::ExternalDataClient;
use crate::notifier::Notifier;
use crate::registry::Registry;

/// The canonical event shape handed to every notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub deviceid: i64,
    pub name: String,
    pub uniqueid: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub eventtime: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofencename: Option<String>,
}

#[derive(Clone)]
pub struct EventEngine {
    registry: Registry,
    external: ExternalDataClient,
    notifier: Notifier,
}

impl EventEngine {
    pub fn new(registry: Registry, external: ExternalDataClient, notifier: Notifier) -> Self {
        EventEngine {
            registry,
            external,
            notifier,
        }
    }

    /// Resolve subscribers for `event.deviceid`, fan the event out to each
    /// over push and WebSocket, and — for the whitelisted event types — to
    /// WhatsApp. Per-subscriber failures are isolated by the notifier; this
    /// only fails if subscriber resolution itself fails.
    pub async fn dispatch(&self, event: EventPayload) -> Result<(), GatewayError> {
        let user_ids = self.external.get_users_for_device(event.deviceid).await?;

        for user_id in &user_ids {
            self.notifier.fan_out_to_user(*user_id, &event).await;

            let tokens = self
                .external
                .get_push_tokens_for_user(*user_id, event_type_tag(event.event_type))
                .await
                .unwrap_or_default();
            if !tokens.is_empty() {
                self.notifier.dispatch_push(&tokens, &event).await;
            }
        }

        if event.event_type.notifies_whatsapp() {
            if let Some(device) = self.registry.get_by_id(event.deviceid).await {
                if !device.contactos.is_empty() {
                    self.notifier.dispatch_whatsapp(&device.contactos, &event).await;
                }
            }
        }

        Ok(())
    }
}

fn event_type_tag(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Position => "position",
        EventType::IgnitionOn => "ignitionOn",
        EventType::IgnitionOff => "ignitionOff",
        EventType::Sos => "sos",
        EventType::LowBattery => "lowBattery",
        EventType::DeviceMoving => "deviceMoving",
        EventType::DeviceOverspeed => "deviceOverspeed",
        EventType::GeofenceAlarm => "geofenceAlarm",
        EventType::GeofenceEnter => "geofenceEnter",
        EventType::GeofenceExit => "geofenceExit",
        EventType::PowerCut => "powerCut",
        EventType::Alarm => "alarm",
        EventType::AccidentAlarm => "accidentAlarm",
        EventType::BonnetAlarm => "bonnetAlarm",
        EventType::FootBrakeAlarm => "footBrakeAlarm",
        EventType::DoorAlarm => "doorAlarm",
        EventType::DeviceOffline => "deviceOffline",
        EventType::Fault => "fault",
        EventType::FuelLeak => "fuelLeak",
        EventType::Temperature => "temperature",
        EventType::Tpms => "TPMS",
        EventType::Rfid => "RFID",
        EventType::Unknown => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tag_matches_wire_naming() {
        assert_eq!(event_type_tag(EventType::Sos), "sos");
        assert_eq!(event_type_tag(EventType::GeofenceEnter), "geofenceEnter");
        assert_eq!(event_type_tag(EventType::Tpms), "TPMS");
        assert_eq!(event_type_tag(EventType::Rfid), "RFID");
    }

    #[test]
    fn now_event_omits_geofencename_when_absent() {
        let event = now_event(1, "Truck 7", "u1", EventType::Sos, Some(1.0), Some(2.0));
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("geofencename"));
        assert!(json.contains("\"type\":\"sos\""));
    }
}

pub fn now_event(
    device_id: i64,
    name: impl Into<String>,
    uniqueid: impl Into<String>,
    event_type: EventType,
    lat: Option<f64>,
    lon: Option<f64>,
) -> EventPayload {
    EventPayload {
        deviceid: device_id,
        name: name.into(),
        uniqueid: uniqueid.into(),
        event_type,
        eventtime: Utc::now(),
        latitude: lat,
        longitude: lon,
        geofencename: None,
    }
}
