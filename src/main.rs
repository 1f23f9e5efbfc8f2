//! Binary entry point: tracing, settings, serve.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tokenman::install_panic_hook();

    tokenman::config::init_from_disk();

    if let Err(e) = tokenman::server::serve().await {
        tracing::error!(target: "tokenman", "{e}");
        std::process::exit(1);
    }
}
