//! Listener Pool (C2): one bound socket per (protocol, transport) pair,
//! each framing its own byte stream and handing decoded records to the
//! router.
//!
//! Grounded on `mayara-server/src/locator.rs`'s per-socket receive loop
//! (accept/receive, decode, route, respawn) and on `Session::new`'s pattern
//! of wiring one named `tokio-graceful-shutdown` subsystem per listener so
//! each protocol's ingestion can be started, logged, and shut down
//! independently.

mod framing;

use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use gateway_core::protocol::{
    gps103::Gps103Decoder, h02::H02Decoder, osmand::OsmAndDecoder, teltonika::TeltonikaDecoder,
};
use gateway_core::{Decoder, NormalizedRecord, Transport};

use crate::events::EventEngine;
use crate::external::ExternalDataClient;
use crate::position::{resolve_unknown_uniqueid, PositionUpdater};
use crate::registry::Registry;

/// One listening endpoint: a protocol name (for logging/subsystem naming)
/// and the port(s) it binds.
#[derive(Clone, Copy, Debug)]
pub struct ListenerSpec {
    pub name: &'static str,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
}

/// The example deployment table from the interface contract: GPS103 on
/// 6001/tcp, H02 on 6013/tcp, Teltonika on 6027/tcp+udp, OsmAnd on
/// 6055/tcp.
pub const DEFAULT_LISTENERS: &[ListenerSpec] = &[
    ListenerSpec { name: "gps103", tcp_port: Some(6001), udp_port: None },
    ListenerSpec { name: "h02", tcp_port: Some(6013), udp_port: None },
    ListenerSpec { name: "teltonika", tcp_port: Some(6027), udp_port: Some(6027) },
    ListenerSpec { name: "osmand", tcp_port: Some(6055), udp_port: None },
];

#[derive(Clone)]
pub struct Router {
    registry: Registry,
    external: ExternalDataClient,
    position: PositionUpdater,
    events: EventEngine,
}

impl Router {
    pub fn new(
        registry: Registry,
        external: ExternalDataClient,
        position: PositionUpdater,
        events: EventEngine,
    ) -> Self {
        Router { registry, external, position, events }
    }

    pub async fn route(&self, records: Vec<NormalizedRecord>) {
        for record in records {
            match record {
                NormalizedRecord::Position { .. } => self.position.apply(record).await,
                NormalizedRecord::Connection { uniqueid, .. } => {
                    self.handle_connection(uniqueid).await
                }
                NormalizedRecord::Event {
                    uniqueid,
                    event_type,
                    datetime,
                    lat,
                    lon,
                    ..
                } => self.handle_event(uniqueid, event_type, datetime, lat, lon).await,
            }
        }
    }

    async fn handle_connection(&self, uniqueid: String) {
        if self.registry.get_by_uniqueid(&uniqueid).await.is_none() {
            resolve_unknown_uniqueid(&self.registry, &self.external, &uniqueid).await;
        }
        self.registry
            .mutate(&uniqueid, |d| d.status = gateway_core::DeviceStatus::Online)
            .await;
    }

    async fn handle_event(
        &self,
        uniqueid: String,
        event_type: gateway_core::EventType,
        datetime: chrono::DateTime<chrono::Utc>,
        lat: Option<f64>,
        lon: Option<f64>,
    ) {
        if event_type == gateway_core::EventType::Unknown {
            return;
        }
        if self.registry.get_by_uniqueid(&uniqueid).await.is_none() {
            resolve_unknown_uniqueid(&self.registry, &self.external, &uniqueid).await;
        }
        let Some(device) = self.registry.get_by_uniqueid(&uniqueid).await else {
            debug!("dropping event for still-unresolved uniqueid {uniqueid}");
            return;
        };

        let mut event = crate::events::now_event(
            device.id,
            device.name.clone(),
            device.uniqueid.clone(),
            event_type,
            lat.or(Some(device.latitude)),
            lon.or(Some(device.longitude)),
        );
        event.eventtime = datetime;

        if let Err(err) = self.events.dispatch(event).await {
            warn!("failed to dispatch {event_type:?} event for device {}: {err}", device.id);
        }
    }
}

pub async fn run_all(
    subsys: &SubsystemHandle,
    bind: IpAddr,
    specs: &[ListenerSpec],
    router: Router,
) {
    for spec in specs {
        let spec = *spec;
        let router = router.clone();
        subsys.start(SubsystemBuilder::new(spec.name, move |s| {
            run_one(s, bind, spec, router)
        }));
    }
}

async fn run_one(
    subsys: SubsystemHandle,
    bind: IpAddr,
    spec: ListenerSpec,
    router: Router,
) -> anyhow::Result<()> {
    let mut handles = Vec::new();

    if let Some(port) = spec.tcp_port {
        let addr = SocketAddr::new(bind, port);
        let listener = TcpListener::bind(addr).await?;
        info!("{} TCP listener bound on {addr}", spec.name);
        let name = spec.name;
        let router = router.clone();
        let child = subsys.create_cancellation_token();
        handles.push(tokio::spawn(async move {
            accept_loop(listener, name, router, child).await;
        }));
    }

    if let Some(port) = spec.udp_port {
        let addr = SocketAddr::new(bind, port);
        let socket = UdpSocket::bind(addr).await?;
        info!("{} UDP listener bound on {addr}", spec.name);
        let name = spec.name;
        let router = router.clone();
        let child = subsys.create_cancellation_token();
        handles.push(tokio::spawn(async move {
            udp_loop(socket, name, router, child).await;
        }));
    }

    subsys.on_shutdown_requested().await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    name: &'static str,
    router: Router,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("{name} connection from {peer}");
                        let router = router.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            handle_tcp_connection(stream, name, router, cancel).await;
                        });
                    }
                    Err(err) => warn!("{name} accept failed: {err}"),
                }
            }
        }
    }
}

async fn handle_tcp_connection(
    stream: TcpStream,
    name: &'static str,
    router: Router,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut decoder: Box<dyn Decoder + Send> = make_decoder(name);
    let mut reader = framing::FrameReader::new(stream, framing::policy_for(name));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = reader.next_frame() => {
                match frame {
                    Ok(Some(bytes)) => {
                        let records = decoder.decode(&bytes, Transport::Tcp);
                        router.route(records).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("{name} connection read error: {err}");
                        break;
                    }
                }
            }
        }
    }
}

async fn udp_loop(
    socket: UdpSocket,
    name: &'static str,
    router: Router,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        debug!("{name} datagram from {peer} ({n} bytes)");
                        let mut decoder = make_decoder(name);
                        let records = decoder.decode(&buf[..n], Transport::Udp);
                        router.route(records).await;
                    }
                    Err(err) => warn!("{name} recv failed: {err}"),
                }
            }
        }
    }
}

fn make_decoder(name: &str) -> Box<dyn Decoder + Send> {
    match name {
        "gps103" => Box::new(Gps103Decoder::new()),
        "h02" => Box::new(H02Decoder::new()),
        "osmand" => Box::new(OsmAndDecoder::new()),
        "teltonika" => Box::new(TeltonikaDecoder::new()),
        other => unreachable!("no decoder registered for listener {other}"),
    }
}
