//! Position Updater (C4): applies a decoded position to the registry,
//! resolving unknown uniqueids through one selective refresh, and derives
//! geofence-crossing events from the before/after state.
//!
//! Grounded on `mayara-server/src/radar/mod.rs`'s update-then-diff pattern:
//! a radar's state is replaced, then the difference against its previous
//! value decides what gets broadcast. Here the "difference" is containment
//! in each geofence bound to the device.

use chrono::{DateTime, Utc};
use log::{debug, warn};

use gateway_core::NormalizedRecord;

use crate::events::{now_event, EventEngine};
use crate::external::ExternalDataClient;
use crate::registry::Registry;

#[derive(Clone)]
pub struct PositionUpdater {
    registry: Registry,
    external: ExternalDataClient,
    events: EventEngine,
}

impl PositionUpdater {
    pub fn new(registry: Registry, external: ExternalDataClient, events: EventEngine) -> Self {
        PositionUpdater {
            registry,
            external,
            events,
        }
    }

    /// Applies a single decoded record. Non-`Position` records are routed
    /// elsewhere by the listener and never reach this method.
    pub async fn apply(&self, record: NormalizedRecord) {
        let NormalizedRecord::Position {
            uniqueid,
            datetime,
            lat,
            lon,
            speed,
            course,
            valid,
            ..
        } = record
        else {
            return;
        };

        if !valid {
            debug!("dropping invalid fix for {uniqueid}");
            return;
        }

        if self.registry.get_by_uniqueid(&uniqueid).await.is_none() {
            self.resolve_unknown(&uniqueid).await;
        }

        let Some(previous) = self.registry.get_by_uniqueid(&uniqueid).await else {
            debug!("dropping fix for still-unresolved uniqueid {uniqueid}");
            return;
        };

        if let Some(last) = previous.lastupdate {
            if datetime <= last {
                debug!("dropping out-of-order fix for {uniqueid}: {datetime} <= {last}");
                return;
            }
        }

        let laststop = if speed == 0.0 {
            previous.laststop
        } else {
            Some(datetime)
        };

        let device_id = previous.id;
        let updated = self
            .registry
            .mutate(&uniqueid, move |d| {
                d.latitude = lat;
                d.longitude = lon;
                d.speed = speed;
                d.course = course;
                d.lastupdate = Some(datetime);
                d.laststop = laststop;
                d.status = gateway_core::DeviceStatus::Online;
            })
            .await;

        let Some(updated) = updated else { return };

        self.evaluate_geofences(device_id, &previous, &updated, lat, lon, datetime)
            .await;
    }

    /// If a uniqueid has never been seen, attempt exactly one
    /// registry-wide selective refresh before giving up on this fix.
    async fn resolve_unknown(&self, uniqueid: &str) {
        resolve_unknown_uniqueid(&self.registry, &self.external, uniqueid).await;
    }

    async fn evaluate_geofences(
        &self,
        device_id: i64,
        previous: &gateway_core::Device,
        updated: &gateway_core::Device,
        lat: f64,
        lon: f64,
        datetime: DateTime<Utc>,
    ) {
        let geofences = match self.external.get_geofences_for_device(device_id).await {
            Ok(g) => g,
            Err(err) => {
                warn!("geofence lookup for device {device_id} failed: {err}");
                return;
            }
        };

        let was_inside_before = previous.lastupdate.is_some();
        for geofence in geofences {
            let now_inside = geofence.shape.contains(lat, lon);
            let was_inside = was_inside_before
                && geofence.shape.contains(previous.latitude, previous.longitude);

            if now_inside == was_inside {
                continue;
            }

            let event_type = if now_inside {
                gateway_core::EventType::GeofenceEnter
            } else {
                gateway_core::EventType::GeofenceExit
            };
            let mut event = now_event(
                device_id,
                updated.name.clone(),
                updated.uniqueid.clone(),
                event_type,
                Some(lat),
                Some(lon),
            );
            event.eventtime = datetime;
            event.geofencename = Some(geofence.name.clone());

            if let Err(err) = self.events.dispatch(event).await {
                warn!(
                    "failed to dispatch geofence event for device {device_id}: {err}"
                );
            }
        }
    }
}

/// Shared by the Position Updater and the listener router: collapse
/// concurrent lookups of the same unseen uniqueid into one upstream refresh.
pub(crate) async fn resolve_unknown_uniqueid(
    registry: &Registry,
    external: &ExternalDataClient,
    uniqueid: &str,
) {
    let inner_registry = registry.clone();
    let external = external.clone();
    let uniqueid_owned = uniqueid.to_string();
    registry
        .with_refresh_gate(move || async move {
            let registry = inner_registry;
            if registry.get_by_uniqueid(&uniqueid_owned).await.is_some() {
                return;
            }
            match external.load_all_devices().await {
                Ok(devices) => registry.merge_selective(devices).await,
                Err(err) => warn!("selective refresh for {uniqueid_owned} failed: {err}"),
            }
        })
        .await;
}
