use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

mod app;
mod quit;
mod stress;

#[derive(Parser, Debug)]
#[command(author, version, about = "boxcat - drive IRC clients against a server under test", long_about = None)]
struct Args {
    /// Path to harness configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and launch the server, connect one client and log its traffic
    Watch {
        #[arg(long, default_value = "client1")]
        nick: String,
    },
    /// Open many short-lived registrations against running servers
    Stress {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to connect to (repeatable)
        #[arg(long = "port", required = true)]
        ports: Vec<u16>,
        /// Concurrent clients per port
        #[arg(long, default_value_t = 10)]
        per_port: usize,
        /// Registrations each client makes
        #[arg(long, default_value_t = 1)]
        rounds: usize,
        /// Starting nick; collisions move on to the next candidate
        #[arg(long, default_value = "stress")]
        nick: String,
    },
    /// Register, join a channel and quit straight away
    Quit {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "quitter")]
        nick: String,
        #[arg(long, default_value = "#test")]
        channel: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    info!("Starting boxcat v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if let Some(config_path) = args.config {
        boxcat_core::config::HarnessConfig::load_from_path(config_path)?
    } else {
        boxcat_core::config::HarnessConfig::load_or_default()
    };

    match args.command {
        Command::Watch { nick } => {
            info!("Server directory: {}", config.server.directory);
            app::watch(config, nick).await?;
        }
        Command::Stress {
            host,
            ports,
            per_port,
            rounds,
            nick,
        } => {
            let plan = stress::StressPlan {
                host,
                ports,
                per_port,
                rounds,
                nick,
            };
            stress::run(plan, &config.client).await?;
        }
        Command::Quit {
            host,
            port,
            nick,
            channel,
        } => {
            quit::run(&host, port, &nick, &channel, &config.client).await?;
        }
    }

    Ok(())
}
