//! Notifier (C7): the fan-out edge. Every channel — Expo push, the
//! WebSocket hub, WhatsApp — gets its own isolated failure path so one dead
//! push token or one unreachable webhook never blocks the others.
//!
//! Grounded on `mayara-server/src/web.rs`'s broadcast-to-many loop (each
//! subscriber's send is isolated: a `Lagged`/closed receiver only drops that
//! one subscriber, never the broadcast itself) and on the shared,
//! lazily-built `reqwest::Client` held by `mayara-server`'s `Session`.

use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::events::EventPayload;
use crate::settings::Settings;
use crate::ws_hub::WsHub;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    settings: Settings,
    ws_hub: WsHub,
}

#[derive(Serialize)]
struct ExpoMessage<'a> {
    to: &'a str,
    sound: &'a str,
    title: &'a str,
    body: String,
    data: &'a EventPayload,
}

impl Notifier {
    pub fn new(settings: Settings, ws_hub: WsHub) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .expect("reqwest client build with static config cannot fail");
        Notifier {
            http,
            settings,
            ws_hub,
        }
    }

    pub async fn fan_out_to_user(&self, user_id: i64, event: &EventPayload) {
        self.ws_hub.fan_out_to_user(user_id, event).await;
    }

    pub async fn fan_out_to_guest(&self, token: &str, event: &EventPayload) {
        self.ws_hub.fan_out_to_guest(token, event).await;
    }

    /// Sends one Expo push request per token, dropping per-token failures —
    /// an unrecognized event type suppresses the whole batch rather than
    /// sending a templateless notification.
    pub async fn dispatch_push(&self, tokens: &[String], event: &EventPayload) {
        let Some((title, body)) = push_template(event) else {
            return;
        };
        for token in tokens {
            let message = ExpoMessage {
                to: token,
                sound: "default",
                title,
                body: body.clone(),
                data: event,
            };
            match self.http.post(EXPO_PUSH_URL).json(&message).send().await {
                Ok(resp) => {
                    // Drain the body so the connection can be reused even if
                    // we never inspect Expo's per-ticket receipt.
                    let _ = resp.bytes().await;
                }
                Err(err) => {
                    warn!("push notification to {token} failed: {err}");
                }
            }
        }
    }

    /// Best-effort, fire-and-forget WhatsApp send to each number in
    /// `contactos`, prefixed with Peru's country code.
    pub async fn dispatch_whatsapp(&self, contactos: &[String], event: &EventPayload) {
        let Some(body) = whatsapp_template(event) else {
            return;
        };
        for number in contactos {
            let to = format!("51{number}");
            let url = format!("{}/messages", self.settings.url_host_api_whatsapp);
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.settings.token_api_whatsapp)
                .json(&serde_json::json!({ "to": to, "body": body }))
                .send()
                .await;
            if let Err(err) = result {
                warn!("whatsapp send to {to} failed: {err}");
            }
        }
    }
}

fn push_template(event: &EventPayload) -> Option<(&'static str, String)> {
    use gateway_core::EventType::*;
    let (title, body) = match event.event_type {
        Sos => ("SOS", format!("{} triggered an SOS alert", event.name)),
        LowBattery => ("Low battery", format!("{} battery is low", event.name)),
        PowerCut => ("Power disconnected", format!("{} lost main power", event.name)),
        GeofenceEnter => (
            "Geofence entered",
            format!(
                "{} entered {}",
                event.name,
                event.geofencename.as_deref().unwrap_or("a geofence")
            ),
        ),
        GeofenceExit => (
            "Geofence exited",
            format!(
                "{} left {}",
                event.name,
                event.geofencename.as_deref().unwrap_or("a geofence")
            ),
        ),
        DeviceOffline => ("Device offline", format!("{} stopped reporting", event.name)),
        Unknown => return None,
        _ => return None,
    };
    Some((title, body))
}

fn whatsapp_template(event: &EventPayload) -> Option<String> {
    push_template(event).map(|(title, body)| format!("{title}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::now_event;
    use gateway_core::EventType;

    #[test]
    fn push_template_suppresses_unknown() {
        let event = now_event(1, "unit", "u1", EventType::Unknown, None, None);
        assert!(push_template(&event).is_none());
    }

    #[test]
    fn push_template_suppresses_untemplated_types() {
        let event = now_event(1, "unit", "u1", EventType::Position, None, None);
        assert!(push_template(&event).is_none());
    }

    #[test]
    fn push_template_sos_mentions_device_name() {
        let event = now_event(1, "Truck 7", "u1", EventType::Sos, None, None);
        let (title, body) = push_template(&event).expect("sos has a template");
        assert_eq!(title, "SOS");
        assert!(body.contains("Truck 7"));
    }

    #[test]
    fn whatsapp_template_wraps_push_template() {
        let event = now_event(1, "Truck 7", "u1", EventType::LowBattery, None, None);
        let body = whatsapp_template(&event).expect("low battery has a template");
        assert!(body.starts_with("Low battery:"));
    }
}
