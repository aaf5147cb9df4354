//! civipipe - civic meeting document pipeline orchestrator.
//!
//! Fetches meeting documents from municipal sites, OCRs them, compiles
//! per-site searchable databases, and deploys the results.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use civipipe::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "civipipe=info"
    } else {
        "civipipe=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
