use anyhow::Result;
use clap::Parser;
use sni_proxy::app::ProxyApp;
use sni_proxy::cli::Cli;
use sni_proxy::logging::init_tracing;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let app = ProxyApp::bootstrap(cli.settings()?).await?;

    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down");
                shutdown.cancel();
            }
            Err(err) => warn!("cannot listen for Ctrl+C: {err}"),
        }
    });

    app.run().await
}
