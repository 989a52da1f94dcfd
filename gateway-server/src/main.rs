use std::time::Duration;

use clap::Parser;
use gateway_server::session;
use gateway_server::settings::{Cli, Settings};
use tokio_graceful_shutdown::Toplevel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    let settings = Settings::from_env()?;

    Toplevel::new(move |s| async move {
        if let Err(err) = session::run(s, cli, settings).await {
            log::error!("session exited with error: {err}");
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(|err| anyhow::anyhow!("shutdown error: {err}"))
}
