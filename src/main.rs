use tracing::error;

use fitness_explorer::middleware::{ExplorerConfig, run};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match ExplorerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
