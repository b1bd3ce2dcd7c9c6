use anyhow::{Error, Result};
use overpush_gateway::{
    config::Config,
    lifecycle::{Lifecycle, shutdown_signal},
    telemetry,
};
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    telemetry::init(config.log_format);

    let lifecycle = Lifecycle::new(config.server_config());

    let shutdown = lifecycle.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    if let Err(e) = lifecycle.run(&config).await {
        error!(error = %e, "Gateway stopped with error");
        return Err(e);
    }

    Ok(())
}
