//! Gantry worker process
//!
//! Started by the supervisor, one process per partition assignment. Reads
//! commands from stdin and writes replies to stdout; all logging goes to
//! stderr so it never corrupts the protocol stream.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("GANTRY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = gantry_engine::worker::serve(tokio::io::stdin(), tokio::io::stdout()).await {
        tracing::error!(error = %e, "worker failed");
        std::process::exit(1);
    }
}
