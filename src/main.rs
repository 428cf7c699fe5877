use chawk_webhooks::config::Config;
use chawk_webhooks::server::Server;
use chawk_webhooks::telemetry;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init_tracing();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Loaded configuration: {:?}", config);

    // Start the delivery engine and serve the API
    let server = Server::new(&config).await?;
    server.run().await
}
