use clap::Parser;
use lobsterbridge::cli::{Cli, Commands, ConfigAction};
use lobsterbridge::config::{validate_config, Config, ConfigManager};
use lobsterbridge::gateway::GatewayError;
use lobsterbridge::{logging, supervisor};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(opts) => {
            let manager = match ConfigManager::load(Path::new(&opts.config)) {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    logging::init("info");
                    error!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            logging::init(&manager.snapshot().debug.level);

            if let Err(e) = supervisor::run(manager.clone()).await {
                report_startup_failure(&e, &manager);
                std::process::exit(1);
            }
        }
        Commands::Config(opts) => {
            logging::init("info");
            let path = Path::new(&opts.config);
            match opts.action {
                ConfigAction::Show => match Config::load(path) {
                    Ok(config) => println!(
                        "{}",
                        serde_json::to_string_pretty(&config).expect("config serializes")
                    ),
                    Err(e) => {
                        error!("{e}");
                        std::process::exit(1);
                    }
                },
                ConfigAction::Validate => match Config::load(path) {
                    Ok(config) => {
                        let errors = validate_config(&config);
                        if errors.is_empty() {
                            info!("Configuration is valid");
                        } else {
                            for validation_error in &errors {
                                error!("{validation_error}");
                            }
                            std::process::exit(1);
                        }
                    }
                    Err(e) => {
                        error!("{e}");
                        std::process::exit(1);
                    }
                },
                ConfigAction::Init => {
                    if let Err(e) = Config::write_default(path) {
                        error!("failed to write config: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Version => {
            println!("lobsterbridge {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

/// Port-in-use failures get a checklist; everything else a plain error.
fn report_startup_failure(e: &anyhow::Error, manager: &ConfigManager) {
    if let Some(GatewayError::Bind { addr, source }) = e.downcast_ref::<GatewayError>() {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            let port = manager.snapshot().gateway.port;
            error!("port {port} is already in use ({addr}); check that:");
            error!("  1. no other lobsterbridge instance is running");
            error!("  2. the port in config.toml is free");
            error!("  3. `ss -ltnp | grep {port}` shows which process holds it");
            return;
        }
        error!("network error: {source}");
        return;
    }
    error!("startup failed: {e}");
}
