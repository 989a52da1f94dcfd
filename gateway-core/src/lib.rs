//! # Gateway Core
//!
//! Platform-independent protocol and domain library for the tracking gateway.
//!
//! This crate contains pure parsing and domain logic with **zero I/O
//! dependencies**: no tokio, no sockets. It decodes device-specific wire
//! frames into a single normalized record shape and evaluates geofence
//! containment, so the same logic is trivially unit-testable without ever
//! opening a socket.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  gateway-core (platform-independent, no tokio/async deps)   │
//! │  ├── protocol/     (wire frame decoding, per device family)│
//! │  ├── model/        (Device, NormalizedRecord, EventType)    │
//! │  ├── geofence/     (polygon/circle containment)             │
//! │  └── error/        (ParseError taxonomy)                    │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲
//!      ┌──────────┴──────────┐
//!      │  gateway-server      │
//!      │  (tokio listeners)   │
//!      └──────────────────────┘
//! ```
//!
//! ## Supported device protocols
//!
//! | Family     | Transport   | Notes                              |
//! |------------|-------------|-------------------------------------|
//! | GPS103     | TCP (text)  | comma-delimited, stateful photo xfer|
//! | H02        | TCP (text+binary) | `*HQ,...#` text and binary frames |
//! | OsmAnd     | TCP (HTTP)  | one request per `\r\n\r\n` boundary |
//! | Teltonika  | TCP + UDP   | codec 8/8E/GH3000/16 AVL records    |
//!
//! ## Key modules
//!
//! - [`protocol`] - the [`protocol::Decoder`] trait and per-family decoders
//! - [`model`] - [`model::Device`], [`model::NormalizedRecord`], [`model::EventType`]
//! - [`geofence`] - polygon and circle containment tests
//! - [`error`] - [`error::ParseError`]

pub mod error;
pub mod geofence;
pub mod model;
pub mod protocol;

pub use error::ParseError;
pub use geofence::parse_area;
pub use model::{
    Device, DeviceStatus, EventType, Geofence, GeofenceShape, GuestToken, NormalizedRecord,
    Transport,
};
pub use protocol::Decoder;
