use clap::{Arg, Command};
use relay::{build_router, AppState};
use std::path::Path;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let matches = Command::new("Flagstream Relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-tenant edge relay for feature-flag delivery")
        .arg(
            Arg::new("config")
                .help("Path to the relay TOML config")
                .short('c')
                .long("config")
                .default_value("/etc/flagstream/relay.toml"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");
    let config = match relay::config::load_config_from_path(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState::from_config(&config).await;
    let router = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {}", config.bind, e);
            std::process::exit(1);
        }
    };
    info!(bind = %config.bind, environments = config.environments.len(), "relay listening");

    if let Err(e) = axum::serve(listener, router).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
