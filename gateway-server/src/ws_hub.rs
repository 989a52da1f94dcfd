//! WebSocket Hub (C8): per-connection authentication, registration, and
//! periodic re-snapshotting, plus the guest-token table share links
//! authenticate against.
//!
//! Grounded on `mayara-server/src/web.rs`'s `spokes_handler`/`spokes_stream`
//! pair: `WebSocketUpgrade` into a per-socket task that `tokio::select!`s
//! between inbound frames (here: just detecting close) and outbound
//! messages, isolating one lagging/closed subscriber from the rest.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};

use gateway_core::GuestToken;

use crate::external::ExternalDataClient;
use crate::registry::Registry;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

struct HubInner {
    users: HashMap<i64, HashMap<u64, mpsc::UnboundedSender<Message>>>,
    guests: HashMap<String, HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: u64,
}

#[derive(Clone)]
pub struct WsHub {
    inner: Arc<RwLock<HubInner>>,
    registry: Registry,
    external: ExternalDataClient,
}

impl WsHub {
    pub fn new(registry: Registry, external: ExternalDataClient) -> Self {
        WsHub {
            inner: Arc::new(RwLock::new(HubInner {
                users: HashMap::new(),
                guests: HashMap::new(),
                next_id: 0,
            })),
            registry,
            external,
        }
    }

    async fn next_id(&self) -> u64 {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    pub async fn fan_out_to_user(&self, user_id: i64, payload: &impl Serialize) {
        let Ok(json) = serde_json::to_string(payload) else {
            return;
        };
        let mut inner = self.inner.write().await;
        if let Some(sockets) = inner.users.get_mut(&user_id) {
            sockets.retain(|_, tx| tx.send(Message::Text(json.clone().into())).is_ok());
        }
    }

    pub async fn fan_out_to_guest(&self, token: &str, payload: &impl Serialize) {
        let Ok(json) = serde_json::to_string(payload) else {
            return;
        };
        let mut inner = self.inner.write().await;
        if let Some(sockets) = inner.guests.get_mut(token) {
            sockets.retain(|_, tx| tx.send(Message::Text(json.clone().into())).is_ok());
        }
    }

    /// Forcibly drop every socket registered for a guest token, used when a
    /// share link is revoked or expires.
    pub async fn disconnect_guest(&self, token: &str) {
        let mut inner = self.inner.write().await;
        inner.guests.remove(token);
    }

    async fn register_user(&self, user_id: i64, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id().await;
        self.inner
            .write()
            .await
            .users
            .entry(user_id)
            .or_default()
            .insert(id, tx);
        id
    }

    async fn unregister_user(&self, user_id: i64, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(sockets) = inner.users.get_mut(&user_id) {
            sockets.remove(&id);
            if sockets.is_empty() {
                inner.users.remove(&user_id);
            }
        }
    }

    async fn register_guest(&self, token: String, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id().await;
        self.inner
            .write()
            .await
            .guests
            .entry(token)
            .or_default()
            .insert(id, tx);
        id
    }

    async fn unregister_guest(&self, token: &str, id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(sockets) = inner.guests.get_mut(token) {
            sockets.remove(&id);
            if sockets.is_empty() {
                inner.guests.remove(token);
            }
        }
    }

    /// Drives one authenticated user connection: registers it, sends an
    /// initial snapshot, then alternates between periodic re-snapshots and
    /// event fan-out until the socket closes. The device-assignment list is
    /// refetched on every tick (rather than fixed at handshake time) so a
    /// device newly assigned to this user appears without a reconnect.
    pub async fn run_user_socket(&self, socket: WebSocket, user_id: i64, device_ids: Vec<i64>) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = self.register_user(user_id, tx).await;
        debug!("ws user {user_id} connected (conn {conn_id})");

        let mut device_ids = device_ids;
        if let Ok(json) = serde_json::to_string(&self.registry.snapshot_for_user(&device_ids).await) {
            let _ = sink.send(Message::Text(json.into())).await;
        }

        let mut ticker = interval(SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    match self.external.get_devices_for_user(user_id).await {
                        Ok(ids) => device_ids = ids,
                        Err(err) => warn!("failed to refresh device list for user {user_id}: {err}"),
                    }
                    let snapshot = self.registry.snapshot_for_user(&device_ids).await;
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => {
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("failed to serialize snapshot for user {user_id}: {err}"),
                    }
                }
                Some(msg) = rx.recv() => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(err)) => {
                            warn!("ws user {user_id} read error: {err}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        self.unregister_user(user_id, conn_id).await;
        debug!("ws user {user_id} disconnected (conn {conn_id})");
    }

    pub async fn run_guest_socket(&self, socket: WebSocket, token: String, device_id: i64) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn_id = self.register_guest(token.clone(), tx).await;

        if let Ok(json) = serde_json::to_string(&self.registry.snapshot_for_user(&[device_id]).await) {
            let _ = sink.send(Message::Text(json.into())).await;
        }

        let mut ticker = interval(SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    let snapshot = self.registry.snapshot_for_user(&[device_id]).await;
                    if let Ok(json) = serde_json::to_string(&snapshot) {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(msg) = rx.recv() => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }

        self.unregister_guest(&token, conn_id).await;
    }
}

/// The table of active share-link tokens, consulted by guest WebSocket
/// upgrades and mutated by the HTTP control surface (C9 `/api/share`).
#[derive(Clone)]
pub struct GuestTokenStore {
    tokens: Arc<RwLock<HashMap<String, GuestToken>>>,
}

impl GuestTokenStore {
    pub fn new() -> Self {
        GuestTokenStore {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, token: GuestToken) {
        self.tokens.write().await.insert(token.token.clone(), token);
    }

    /// Returns the token's bound device id if it exists and has not expired.
    pub async fn resolve(&self, token: &str) -> Option<i64> {
        let tokens = self.tokens.read().await;
        let entry = tokens.get(token)?;
        if entry.is_expired(Utc::now()) {
            None
        } else {
            Some(entry.device_id)
        }
    }

    pub async fn remove(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Drops every expired entry; called periodically from the liveness
    /// subsystem so the table doesn't grow unbounded.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut tokens = self.tokens.write().await;
        let expired: Vec<String> = tokens
            .iter()
            .filter(|(_, t)| t.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            tokens.remove(key);
        }
        expired
    }
}

impl Default for GuestTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token(token: &str, device_id: i64, expires_in_secs: i64) -> GuestToken {
        GuestToken {
            token: token.to_string(),
            device_id,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[tokio::test]
    async fn resolve_rejects_expired_token() {
        let store = GuestTokenStore::new();
        store.insert(sample_token("t1", 7, -10)).await;
        assert_eq!(store.resolve("t1").await, None);
    }

    #[tokio::test]
    async fn resolve_accepts_live_token() {
        let store = GuestTokenStore::new();
        store.insert(sample_token("t1", 7, 60)).await;
        assert_eq!(store.resolve("t1").await, Some(7));
    }

    #[tokio::test]
    async fn purge_expired_removes_only_expired() {
        let store = GuestTokenStore::new();
        store.insert(sample_token("expired", 1, -1)).await;
        store.insert(sample_token("live", 2, 60)).await;
        let removed = store.purge_expired(Utc::now()).await;
        assert_eq!(removed, vec!["expired".to_string()]);
        assert_eq!(store.resolve("live").await, Some(2));
    }
}
