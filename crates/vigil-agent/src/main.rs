mod settings;
mod supervisor;
mod wiring;

use anyhow::Result;
use clap::Parser;
use settings::Settings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let settings = Settings::parse();
    supervisor::run(settings).await
}
