use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "observer")]
#[command(about = "Chat observer service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: OBSERVER_CONFIG_PATH or ~/.observer/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the observer: connect the event channel, bind the broker
    /// consumers, and bridge until interrupted.
    Run {
        /// Config file path (default: OBSERVER_CONFIG_PATH or ~/.observer/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Rewrite vhost names with the testing prefix for isolated runs.
        #[arg(long)]
        testing: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("observer {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, testing }) => {
            if let Err(e) = run_observer(config, testing).await {
                log::error!("observer failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent()
            .unwrap_or(std::path::Path::new("."))
            .display()
    );
    Ok(())
}

async fn run_observer(
    config_path: Option<std::path::PathBuf>,
    testing: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if testing {
        config.broker.testing = true;
    }
    log::info!(
        "starting observer with config {} (channel {})",
        path.display(),
        config.channel.url
    );
    lib::observer::run_observer(config).await
}
