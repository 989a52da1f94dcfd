//! Process-wide session: constructs every shared service once and wires
//! the Listener Pool, Liveness Loop, and HTTP control surface as named
//! subsystems.
//!
//! Grounded on `mayara-server::Session::new`: one `Arc<RwLock<SessionInner>>`
//! built before any subsystem starts, then each subsystem started against a
//! clone of whatever shared state it needs.

use log::info;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use crate::events::EventEngine;
use crate::external::ExternalDataClient;
use crate::http_api::{self, AppState};
use crate::listener::{self, Router, DEFAULT_LISTENERS};
use crate::liveness;
use crate::notifier::Notifier;
use crate::position::PositionUpdater;
use crate::registry::Registry;
use crate::settings::{Cli, Settings};
use crate::ws_hub::{GuestTokenStore, WsHub};

pub async fn run(subsys: SubsystemHandle, cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let registry = Registry::new();
    let external = ExternalDataClient::new(settings.clone());
    let ws_hub = WsHub::new(registry.clone(), external.clone());
    let guest_tokens = GuestTokenStore::new();
    let notifier = Notifier::new(settings.clone(), ws_hub.clone());
    let events = EventEngine::new(registry.clone(), external.clone(), notifier);
    let position = PositionUpdater::new(registry.clone(), external.clone(), events.clone());

    info!("bootstrapping session against upstream services");
    external.bootstrap_session().await?;
    let devices = external.load_all_devices().await?;
    info!("loaded {} devices from admin API", devices.len());
    registry.replace_all(devices).await;

    let specs: Vec<listener::ListenerSpec> = match &cli.protocol {
        Some(only) => DEFAULT_LISTENERS
            .iter()
            .copied()
            .filter(|spec| spec.name == only)
            .collect(),
        None => DEFAULT_LISTENERS.to_vec(),
    };
    if specs.is_empty() {
        anyhow::bail!("no listener matches --protocol {:?}", cli.protocol);
    }

    let router = Router::new(registry.clone(), external.clone(), position, events.clone());
    listener::run_all(&subsys, cli.bind, &specs, router).await;

    subsys.start(SubsystemBuilder::new("liveness", {
        let registry = registry.clone();
        let events = events.clone();
        let guest_tokens = guest_tokens.clone();
        move |s| liveness::run(s, registry, events, guest_tokens)
    }));

    let app_state = AppState {
        registry,
        external,
        events,
        ws_hub,
        guest_tokens,
    };
    subsys.start(SubsystemBuilder::new("http", {
        let bind = cli.bind;
        let port = cli.port;
        move |s| http_api::run(s, bind, port, app_state)
    }));

    subsys.on_shutdown_requested().await;
    Ok(())
}
