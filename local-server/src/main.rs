mod client;
mod config;
mod logger;
mod server;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use server::{LocalServer, ServerOptions};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "amqp-local-server", version, about = "Local AMQP 1.0 broker and client")]
struct Cli {
    /// Log level, overriding `logging.level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Listen for connections, queue messages and answer `$cbs` requests.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send messages to an address.
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Authenticate through `$cbs` with a SAS connection string.
        #[arg(long)]
        connection_string: Option<String>,
    },
    /// Receive messages from an address.
    Receive {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        source: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        connection_string: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config().context("Failed to load configuration")?;
    apply_overrides(&mut config, &cli.command);
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("{error}");
        }
        bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    let mut logging = config.logging().clone();
    if let Some(level) = &cli.log_level {
        logging = logging.with_level(level);
    }
    logger::setup_logger(&logging).context("Failed to initialize logger")?;

    match cli.command {
        Command::Serve { .. } => serve(&config).await,
        Command::Send { target, count, .. } => {
            client::send(config.client(), &target, count).await
        }
        Command::Receive { source, count, .. } => {
            client::receive(config.client(), &source, count).await
        }
    }
}

fn apply_overrides(config: &mut config::AppConfig, command: &Command) {
    match command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server_mut().set_port(*port);
            }
        }
        Command::Send {
            host,
            port,
            connection_string,
            ..
        }
        | Command::Receive {
            host,
            port,
            connection_string,
            ..
        } => {
            let client = config.client_mut();
            if let Some(host) = host {
                client.set_host(host.clone());
            }
            if let Some(port) = port {
                client.set_port(*port);
            }
            if let Some(connection_string) = connection_string {
                client.set_connection_string(connection_string.clone());
            }
        }
    }
}

async fn serve(config: &config::AppConfig) -> anyhow::Result<()> {
    let server = LocalServer::start(ServerOptions::from(config.server()))
        .await
        .context("Failed to start listener")?;
    let port = server
        .local_port()
        .context("Listener has no local port")?;
    log::info!("Listening on port {port} (Press Ctrl+C to stop)");

    let shutdown = CancellationToken::new();
    let run = server.run(shutdown.clone());
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("Failed to listen for Ctrl+C: {e}");
            }
            log::info!("Shutting down gracefully...");
            shutdown.cancel();
            run.await;
        }
    }
    Ok(())
}
