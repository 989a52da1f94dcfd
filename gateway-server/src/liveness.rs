//! Liveness Loop (C10): periodic online/offline classification.
//!
//! Grounded on `mayara-server/src/radar/mod.rs`'s stale-radar sweep (a timer
//! subsystem that walks `SharedRadars` and drops entries that stopped
//! reporting); here the sweep transitions status in place instead of
//! removing the entry, since a device's identity outlives connectivity.

use chrono::Utc;
use log::warn;
use tokio::time::{interval, Duration};
use tokio_graceful_shutdown::SubsystemHandle;

use gateway_core::{DeviceStatus, EventType};

use crate::events::{now_event, EventEngine};
use crate::registry::Registry;
use crate::ws_hub::GuestTokenStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const OFFLINE_THRESHOLD: chrono::Duration = chrono::Duration::minutes(10);

pub async fn run(
    subsys: SubsystemHandle,
    registry: Registry,
    events: EventEngine,
    guest_tokens: GuestTokenStore,
) -> anyhow::Result<()> {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = subsys.on_shutdown_requested() => break,
            _ = ticker.tick() => {
                sweep(&registry, &events).await;
                guest_tokens.purge_expired(Utc::now()).await;
            }
        }
    }
    Ok(())
}

fn classify(lastupdate: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> DeviceStatus {
    match lastupdate {
        Some(last) if now - last <= OFFLINE_THRESHOLD => DeviceStatus::Online,
        _ => DeviceStatus::Offline,
    }
}

async fn sweep(registry: &Registry, events: &EventEngine) {
    let now = Utc::now();
    for device in registry.all_devices().await {
        let target = classify(device.lastupdate, now);

        if target == device.status {
            continue;
        }

        registry.set_status(device.id, target).await;

        if target == DeviceStatus::Offline && device.status == DeviceStatus::Online {
            let event = now_event(
                device.id,
                device.name.clone(),
                device.uniqueid.clone(),
                EventType::DeviceOffline,
                Some(device.latitude),
                Some(device.longitude),
            );
            if let Err(err) = events.dispatch(event).await {
                warn!("failed to dispatch deviceOffline event for {}: {err}", device.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_online_within_threshold() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(9);
        assert_eq!(classify(Some(last), now), DeviceStatus::Online);
    }

    #[test]
    fn classify_offline_past_threshold() {
        let now = Utc::now();
        let last = now - chrono::Duration::minutes(11);
        assert_eq!(classify(Some(last), now), DeviceStatus::Offline);
    }

    #[test]
    fn classify_offline_when_never_reported() {
        let now = Utc::now();
        assert_eq!(classify(None, now), DeviceStatus::Offline);
    }
}
