use clap::{Parser, Subcommand};
use logfan::cli::tail::TailArgs;
use logfan::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logfan")]
#[command(about = "Tail deployment logs from many sources as one ordered stream", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print log records from one or more log groups
    Tail(TailArgs),
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config file
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Check a config file for errors
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Diagnostics go to stderr; stdout carries the records
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logfan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tail(args) => {
            if let Err(e) = logfan::cli::tail::run(cli.config, args).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { stdout } => {
                logfan::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                let config_path = resolve_config_path(cli.config.as_deref());
                if logfan::cli::config::validate(config_path).is_err() {
                    std::process::exit(1);
                }
            }
        },
    }

    Ok(())
}
