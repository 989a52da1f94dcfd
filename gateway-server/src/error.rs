//! Server-side error taxonomy.
//!
//! Grounded on `mayara-server/src/radar/mod.rs`'s `RadarError`: a flat
//! `thiserror` enum with one `IntoResponse` impl that maps every variant to
//! an HTTP status, so handlers can just `?` out of registry/external-client
//! calls.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("no such device '{0}'")]
    NoSuchDevice(String),
    #[error("no such geofence '{0}'")]
    NoSuchGeofence(i64),
    #[error("guest token expired or unknown")]
    InvalidGuestToken,
    #[error("request not authorized")]
    Unauthorized,
    #[error("external data service request failed: {0}")]
    ExternalRequest(#[from] reqwest::Error),
    #[error("relational store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("external data service returned malformed data: {0}")]
    ExternalMalformed(String),
    #[error("shutdown in progress")]
    Shutdown,
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NoSuchDevice(_) | GatewayError::NoSuchGeofence(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::InvalidGuestToken => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Io(_)
            | GatewayError::ExternalRequest(_)
            | GatewayError::ExternalMalformed(_)
            | GatewayError::Database(_)
            | GatewayError::Shutdown => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
