#[tokio::main]
async fn main() {
    // Default: INFO for this crate, WARN for everything else. Override with
    // RUST_LOG, e.g. `RUST_LOG=ackline=debug,lapin=info`.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ackline=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    if let Err(e) = ackline::app::run().await {
        tracing::error!("❌ fatal: {e}");
        std::process::exit(1);
    }
}
