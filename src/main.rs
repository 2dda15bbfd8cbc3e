//! ESL Call Router
//!
//! Accepts outbound event socket connections from a FreeSWITCH-style media
//! engine, routes each inbound call by its dialed number, and bridges or
//! rejects it.
//!
//! Configuration comes from environment variables (see `ServerConfig`).

mod server;

fn main() {
    // Load environment variables before the log filter reads RUST_LOG
    dotenvy::dotenv().ok();

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("esl_call_router=info")),
        )
        .init();

    let config = match server::ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::run_server(config)) {
        tracing::error!("Server error: {:#}", e);
        std::process::exit(1);
    }
}
