//! HTTP Control Surface (C9): the three operator-facing endpoints that feed
//! back into the registry and event pipeline.
//!
//! Grounded on `mayara-server/src/web.rs`'s `Router::new()...with_state(self)`
//! assembly and its `Web::run` bind-and-serve loop, trimmed to the handful
//! of routes this gateway exposes instead of the full radar-control surface.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDateTime, TimeZone, Utc};
use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tokio_graceful_shutdown::SubsystemHandle;

use gateway_core::{EventType, GuestToken};

use crate::error::GatewayError;
use crate::events::{now_event, EventEngine};
use crate::external::ExternalDataClient;
use crate::registry::Registry;
use crate::ws_hub::{GuestTokenStore, WsHub};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub external: ExternalDataClient,
    pub events: EventEngine,
    pub ws_hub: WsHub,
    pub guest_tokens: GuestTokenStore,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sos", post(post_sos))
        .route("/api/update-devices", get(get_update_devices))
        .route("/api/share", post(post_share))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

pub async fn run(
    subsys: SubsystemHandle,
    bind: std::net::IpAddr,
    port: u16,
    state: AppState,
) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(bind, port)).await?;
    info!("HTTP control surface listening on {bind}:{port}");

    tokio::select! {
        biased;
        _ = subsys.on_shutdown_requested() => {
            info!("HTTP control surface shutting down");
        }
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                warn!("HTTP server exited with error: {err}");
            }
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct SosBody {
    deviceid: i64,
}

async fn post_sos(
    State(state): State<AppState>,
    Json(body): Json<SosBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let device = state
        .registry
        .get_by_id(body.deviceid)
        .await
        .ok_or_else(|| GatewayError::NoSuchDevice(body.deviceid.to_string()))?;

    let event = now_event(
        device.id,
        device.name.clone(),
        device.uniqueid.clone(),
        EventType::Sos,
        Some(device.latitude),
        Some(device.longitude),
    );
    state.events.dispatch(event).await?;

    let external = state.external.clone();
    let lat = device.latitude;
    let lon = device.longitude;
    let device_id = device.id;
    tokio::spawn(async move {
        match external.get_nearby_support_users(lat, lon, None).await {
            Ok(users) => {
                for user_id in users {
                    if let Err(err) = external.assign_device_to_user(user_id, device_id).await {
                        warn!("failed to assign device {device_id} to support user {user_id}: {err}");
                    }
                }
            }
            Err(err) => warn!("failed to resolve nearby support users for device {device_id}: {err}"),
        }
    });

    Ok(axum::http::StatusCode::OK)
}

async fn get_update_devices(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.clone();
    let external = state.external.clone();
    tokio::spawn(async move {
        match external.load_all_devices().await {
            Ok(devices) => registry.merge_selective(devices).await,
            Err(err) => warn!("update-devices refresh failed: {err}"),
        }
    });
    axum::http::StatusCode::ACCEPTED
}

#[derive(Deserialize)]
struct ShareBody {
    deviceid: i64,
    expires_at: String,
    usuario: String,
    #[serde(rename = "contraseña")]
    contrasena: String,
}

#[derive(serde::Serialize)]
struct ShareResponse {
    token: String,
}

async fn post_share(
    State(state): State<AppState>,
    Json(body): Json<ShareBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let auth = state
        .external
        .validate_credentials(&body.usuario, &body.contrasena)
        .await?
        .ok_or(GatewayError::Unauthorized)?;

    let assigned = state
        .external
        .get_devices_for_user(auth.user_id)
        .await?
        .contains(&body.deviceid);
    if !assigned {
        return Err(GatewayError::Unauthorized);
    }

    let expires_at = NaiveDateTime::parse_from_str(&body.expires_at, "%Y-%m-%d %H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| GatewayError::BadRequest("invalid expires_at".to_string()))?;

    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    state
        .guest_tokens
        .insert(GuestToken {
            token: token.clone(),
            device_id: body.deviceid,
            expires_at,
        })
        .await;

    Ok(Json(ShareResponse { token }))
}

/// Authenticated as a user via `u`/`p`, or as a guest via an active share
/// token `t`. Exactly one of the two forms must resolve.
#[derive(Deserialize)]
pub struct WsQuery {
    pub u: Option<String>,
    pub p: Option<String>,
    pub t: Option<String>,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, GatewayError> {
    if let Some(token) = query.t {
        let device_id = state
            .guest_tokens
            .resolve(&token)
            .await
            .ok_or(GatewayError::InvalidGuestToken)?;
        return Ok(ws.on_upgrade(move |socket| async move {
            state.ws_hub.run_guest_socket(socket, token, device_id).await;
        }));
    }

    let (Some(username), Some(password)) = (query.u, query.p) else {
        return Err(GatewayError::Unauthorized);
    };
    let auth = state
        .external
        .validate_credentials(&username, &password)
        .await?
        .ok_or(GatewayError::Unauthorized)?;
    let device_ids = state.external.get_devices_for_user(auth.user_id).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        state.ws_hub.run_user_socket(socket, auth.user_id, device_ids).await;
    }))
}
