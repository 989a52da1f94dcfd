//! External Data Client (C6): a typed facade over the admin API and the
//! relational store. The gateway owns no persistent state of its own beyond
//! a pooled MySQL connection and a `reqwest::Client`; every method here is a
//! network call with a timeout and a typed error.
//!
//! Grounded on the outbound `reqwest::Client` pattern used by
//! `oxidetracks`/`regatta-backend` for the admin-API and auth methods, and on
//! `src/db/database.py` / the `*_controller.py` files for the relational
//! methods: `tc_user_device` backs the user/device assignment queries and
//! `tc_device_geofence` joined with `tc_geofences` backs the geofence
//! lookup. `bootstrap_session` mirrors the startup login call in
//! `server/utils.py::login`.

use std::time::Duration;

use gateway_core::{parse_area, Device, Geofence};
use log::warn;
use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::MySqlPool;

use crate::error::GatewayError;
use crate::settings::Settings;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ExternalDataClient {
    http: reqwest::Client,
    settings: Settings,
    db: MySqlPool,
    session_token: std::sync::Arc<tokio::sync::RwLock<Option<String>>>,
}

#[derive(Debug, Deserialize)]
pub struct AuthResult {
    #[serde(rename = "id")]
    pub user_id: i64,
}

/// Sends a request, retrying exactly once on a transport-level failure
/// (dropped connection, reset, timeout) — never on a non-2xx HTTP status.
async fn send_with_retry(req: reqwest::RequestBuilder) -> Result<reqwest::Response, reqwest::Error> {
    let retry = req.try_clone();
    match req.send().await {
        Ok(resp) => Ok(resp),
        Err(err) => match retry {
            Some(retry) => {
                warn!("external request failed ({err}), retrying once");
                retry.send().await
            }
            None => Err(err),
        },
    }
}

impl ExternalDataClient {
    pub fn new(settings: Settings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client build with static config cannot fail");
        let connect_options = MySqlConnectOptions::new()
            .host(&settings.db_host_traccar)
            .port(settings.db_port_traccar)
            .username(&settings.db_user_traccar)
            .password(&settings.db_password_traccar)
            .database(&settings.db_name_traccar);
        let db = MySqlPoolOptions::new()
            .max_connections(10)
            .connect_lazy_with(connect_options);
        ExternalDataClient {
            http,
            settings,
            db,
            session_token: std::sync::Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// One-time service-level login at startup, used for the gateway's own
    /// polling calls rather than per-request user auth.
    pub async fn bootstrap_session(&self) -> Result<(), GatewayError> {
        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }
        let url = format!("{}/login", self.settings.url_host_admin_nwperu);
        let req = self.http.post(&url).json(&serde_json::json!({
            "service_account": true,
        }));
        let resp = send_with_retry(req).await?;
        let resp = resp.error_for_status()?;
        let body: LoginResponse = resp.json().await?;
        *self.session_token.write().await = Some(body.token);
        Ok(())
    }

    pub async fn load_all_devices(&self) -> Result<Vec<Device>, GatewayError> {
        let url = format!("{}/alldevices-info", self.settings.url_host_admin_nwperu);
        let resp = self.admin_get(&url).await?;
        let resp = resp.error_for_status()?;
        resp.json::<Vec<Device>>()
            .await
            .map_err(|e| GatewayError::ExternalMalformed(e.to_string()))
    }

    /// Issues a GET against the admin API, attaching the session token from
    /// `bootstrap_session` when one has been established. Retries once on a
    /// dropped connection.
    async fn admin_get(&self, url: &str) -> Result<reqwest::Response, GatewayError> {
        let mut req = self.http.get(url);
        if let Some(token) = self.session_token.read().await.as_deref() {
            req = req.bearer_auth(token);
        }
        Ok(send_with_retry(req).await?)
    }

    pub async fn get_users_for_device(&self, device_id: i64) -> Result<Vec<i64>, GatewayError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT userid FROM tc_user_device WHERE deviceid = ?")
                .bind(device_id)
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_devices_for_user(&self, user_id: i64) -> Result<Vec<i64>, GatewayError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT deviceid FROM tc_user_device WHERE userid = ?")
                .bind(user_id)
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Joins `tc_device_geofence` against `tc_geofences` and parses each
    /// row's non-standard `area` text. A row whose text doesn't parse is
    /// dropped and logged rather than failing the whole lookup.
    pub async fn get_geofences_for_device(
        &self,
        device_id: i64,
    ) -> Result<Vec<Geofence>, GatewayError> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT g.id, g.name, g.area FROM tc_device_geofence dg \
             JOIN tc_geofences g ON dg.geofenceid = g.id WHERE dg.deviceid = ?",
        )
        .bind(device_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, name, area)| match parse_area(&area) {
                Some(shape) => Some(Geofence { id, name, shape }),
                None => {
                    warn!("geofence {id} ({name}) has unparseable area text, skipping");
                    None
                }
            })
            .collect())
    }

    pub async fn get_push_tokens_for_user(
        &self,
        user_id: i64,
        event_type: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let url = format!(
            "{}/users/{user_id}/push-tokens?eventType={event_type}",
            self.settings.url_host_admin_nwperu
        );
        let resp = self.admin_get(&url).await?;
        let resp = resp.error_for_status()?;
        resp.json::<Vec<String>>()
            .await
            .map_err(|e| GatewayError::ExternalMalformed(e.to_string()))
    }

    pub async fn get_nearby_support_users(
        &self,
        lat: f64,
        lon: f64,
        category: Option<&str>,
    ) -> Result<Vec<i64>, GatewayError> {
        let mut url = format!(
            "{}/support-users/nearby?lat={lat}&lon={lon}",
            self.settings.url_host_admin_nwperu
        );
        if let Some(category) = category {
            url.push_str(&format!("&category={category}"));
        }
        let resp = self.admin_get(&url).await?;
        let resp = resp.error_for_status()?;
        resp.json::<Vec<i64>>()
            .await
            .map_err(|e| GatewayError::ExternalMalformed(e.to_string()))
    }

    pub async fn assign_device_to_user(
        &self,
        user_id: i64,
        device_id: i64,
    ) -> Result<(), GatewayError> {
        sqlx::query("INSERT IGNORE INTO tc_user_device (userid, deviceid) VALUES (?, ?)")
            .bind(user_id)
            .bind(device_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// POSTs email/password to the upstream session endpoint, the way
    /// Traccar's own `POST /api/session` login form works. The previous
    /// service instead sent HTTP Basic auth to a hardcoded device-list
    /// endpoint and treated any 200 response as success; that doesn't carry
    /// a user id, so it can't satisfy this method's `Option<AuthResult>`
    /// contract and isn't reproduced here.
    pub async fn validate_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthResult>, GatewayError> {
        let url = format!("{}/session", self.settings.url_host_traccar);
        let req = self
            .http
            .post(&url)
            .form(&[("email", username), ("password", password)]);
        let resp = send_with_retry(req).await?;
        if resp.status().is_client_error() {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let auth = resp
            .json::<AuthResult>()
            .await
            .map_err(|e| GatewayError::ExternalMalformed(e.to_string()))?;
        Ok(Some(auth))
    }
}
