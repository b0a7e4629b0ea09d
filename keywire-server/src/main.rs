use keywire_server::{run_server, SECURE_PATH};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8001".to_string());
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    info!(%addr, path = SECURE_PATH, "key exchange server listening");
    run_server(listener).await;
}
