//! Command-line flags and environment-derived configuration.
//!
//! Grounded on `mayara-server`'s `Cli` (clap derive, `clap-verbosity-flag`)
//! and `Session::args()` access pattern, adapted to the gateway's listener
//! ports and outbound service endpoints instead of radar discovery flags.

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Parser, Clone, Debug)]
#[command(name = "gateway-server", about = "Real-time GPS fleet-tracking gateway")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Port for the HTTP/WebSocket control surface
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Bind address for all listeners
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Limit ingestion to a single protocol (for testing one listener in isolation)
    #[arg(long)]
    pub protocol: Option<String>,

    /// Limit ingestion to a single network interface
    #[arg(short, long)]
    pub interface: Option<String>,
}

/// Outbound service endpoints and the relational store's connection
/// parameters, read from the environment variables in the interface
/// contract. Constructed once at startup; a missing required variable is
/// fatal before any subsystem starts.
#[derive(Clone, Debug)]
pub struct Settings {
    pub db_host_traccar: String,
    pub db_user_traccar: String,
    pub db_password_traccar: String,
    pub db_name_traccar: String,
    pub db_port_traccar: u16,
    pub url_host_traccar: String,
    pub url_host_admin_nwperu: String,
    pub url_host_api_whatsapp: String,
    pub token_api_whatsapp: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Settings {
            db_host_traccar: require_env("DB_HOST_TRACCAR")?,
            db_user_traccar: require_env("DB_USER_TRACCAR")?,
            db_password_traccar: require_env("DB_PASSWORD_TRACCAR")?,
            db_name_traccar: require_env("DB_NAME_TRACCAR")?,
            db_port_traccar: require_env("DB_PORT_TRACCAR")?
                .parse()
                .map_err(|e| anyhow::anyhow!("DB_PORT_TRACCAR is not a valid port: {e}"))?,
            url_host_traccar: require_env("URL_HOST_TRACCAR")?,
            url_host_admin_nwperu: require_env("URL_HOST_ADMIN_NWPERU")?,
            url_host_api_whatsapp: require_env("URL_HOST_API_WHATSAPP")?,
            token_api_whatsapp: require_env("TOKEN_API_WHATSAPP")?,
        })
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required environment variable {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_var_is_reported_by_name() {
        std::env::remove_var("DB_HOST_TRACCAR");
        let err = require_env("DB_HOST_TRACCAR").unwrap_err();
        assert!(err.to_string().contains("DB_HOST_TRACCAR"));
    }
}
