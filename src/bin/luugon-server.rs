use std::{net::SocketAddr, time::Duration};

use luugon::{api, config, ingest_service::ingest_service_capsule, rate_limit::rate_limiter_capsule};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let container = config::init_container().await?;

    let settings = container.read(config::settings_capsule);
    let app = api::router(container.read(ingest_service_capsule), &settings);

    let rate_limiter = container.read(rate_limiter_capsule);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(rate_limiter.window().max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            rate_limiter.prune();
        }
    });

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
