use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port = std::env::var("PILLARGATE_HTTP_PORT").unwrap_or_else(|_| "7980".to_string());
    let env_name = std::env::var("PILLARGATE_ENV").unwrap_or_else(|_| "development".to_string());
    let data_root = std::env::var("PILLARGATE_DATA_ROOT").unwrap_or_else(|_| "data".to_string());
    let token_mode = std::env::var("PILLARGATE_TOKEN_MODE").unwrap_or_else(|_| "hs256".to_string());
    info!(
        target: "pillargate",
        "pillargate starting: RUST_LOG='{}', http_port={}, env={}, token_mode={}, data_root='{}'",
        rust_log, http_port, env_name, token_mode, data_root
    );

    pillargate::server::run().await
}
