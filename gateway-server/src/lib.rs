//! # Gateway Server
//!
//! Real-time GPS fleet-tracking gateway: multi-protocol TCP/UDP ingestion,
//! an in-memory device registry, geofence-aware position processing, and a
//! WebSocket/push/WhatsApp notification fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         gateway-server                            │
//! │  ┌────────────┐   ┌───────────────┐   ┌─────────────────────┐    │
//! │  │ Listener   │──▶│ Position /    │──▶│ Event Engine (C5)    │    │
//! │  │ Pool (C2)  │   │ Event routing │   │  → Notifier (C7)     │    │
//! │  └────────────┘   └──────┬────────┘   │    → WebSocket (C8)  │    │
//! │         │                │            │    → Expo push       │    │
//! │         ▼                ▼            │    → WhatsApp        │    │
//! │  ┌──────────────────────────────┐     └─────────────────────┘    │
//! │  │   Device Registry (C3)       │                                 │
//! │  │   Arc<RwLock<Inner>>         │◀────  Liveness Loop (C10)        │
//! │  └──────────────────────────────┘                                 │
//! │         ▲                                                          │
//! │         │         ┌──────────────────────────┐                    │
//! │         └─────────│ External Data Client (C6) │◀── HTTP API (C9)   │
//! │                    └──────────────────────────┘                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decoders and the domain model live in [`gateway_core`]; this crate
//! supplies every I/O-touching component: listeners, the registry, the
//! event/notification pipeline, and the HTTP/WebSocket surface.
//!
//! ## Command-Line Interface
//!
//! See [`settings::Cli`] for listener flags; upstream service endpoints and
//! credentials are read from the environment by [`settings::Settings`].

pub mod error;
pub mod events;
pub mod external;
pub mod http_api;
pub mod listener;
pub mod liveness;
pub mod notifier;
pub mod position;
pub mod registry;
pub mod session;
pub mod settings;
pub mod ws_hub;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
