use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "lobsterbridge",
    version,
    about = "Protocol adapter bridging a OneBot-v11 gateway to an upstream bot core"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the adapter.
    Run(RunOpts),
    /// Inspect or scaffold the configuration.
    Config(ConfigOpts),
    /// Print the version.
    Version,
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: String,
}

#[derive(clap::Args)]
pub struct ConfigOpts {
    #[arg(short, long, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: String,
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,
    /// Parse and validate the configuration.
    Validate,
    /// Write a default config file.
    Init,
}
