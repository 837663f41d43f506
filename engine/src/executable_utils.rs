use clap::Parser;
use common::config::Config;
use std::error::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: String,
}

/// Shared startup for the engine executables: env, CLI args, config file,
/// tracing subscriber.
pub fn initialize_executable() -> Result<Config, Box<dyn Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!(
        "starting {} (config: {})",
        config.common.project_name,
        args.config
    );

    Ok(config)
}
