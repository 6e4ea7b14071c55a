//! HixTunnel Client
//!
//! A CLI tool for exposing a local HTTP or TCP service through a HixTunnel
//! broker. The broker allocates a public address; this client keeps a
//! WebSocket session open and relays traffic to the local port.
//!
//! The client authenticates using API tokens saved with `hixtunnel auth`.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;
#[cfg(test)]
mod testing;

use client::{Broker, ControlClient, Controller, LifecycleState, SessionState, TunnelOptions};
use config::{mask_token, normalize_server, Config};
use protocol::{TunnelId, TunnelProtocol};

#[derive(Parser, Debug)]
#[command(name = "hixtunnel")]
#[command(author, version, about = "Expose local HTTP and TCP services through HixTunnel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Broker URL (e.g. https://tunnel.example.com)
    #[arg(short, long, global = true, env = "HIXTUNNEL_SERVER_URL")]
    server: Option<String>,

    /// API token for authentication
    #[arg(short = 'k', long, global = true, env = "HIXTUNNEL_API_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save an API token and/or broker URL (use with --token / --server)
    Auth,

    /// Show the current configuration
    Config,

    /// Start a tunnel to a local service
    Start(StartArgs),

    /// Deregister a tunnel by id
    Stop {
        /// Tunnel id printed by `start`
        tunnel_id: String,
    },
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Tunnel protocol (http or tcp)
    #[arg(short = 'P', long, default_value = "http")]
    protocol: TunnelProtocol,

    /// Local port to expose
    #[arg(short, long)]
    port: u16,

    /// Local host to forward to
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable config: {:#}", e);
        Config::default()
    });

    match cli.command {
        Some(Commands::Auth) => run_auth(cli.token, cli.server.as_deref()),
        Some(Commands::Config) => run_config(cli.server.as_deref(), &config),
        Some(Commands::Start(args)) => {
            run_start(cli.token, cli.server.as_deref(), args, config).await
        }
        Some(Commands::Stop { tunnel_id }) => {
            run_stop(cli.token, cli.server.as_deref(), tunnel_id, &config).await
        }
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  hixtunnel auth --token <TOKEN>          Save your API token");
            eprintln!("  hixtunnel start -P http -p 3000         Expose localhost:3000");
            eprintln!("  hixtunnel start -P tcp -p 22            Expose a raw TCP port");
            std::process::exit(1);
        }
    }
}

fn resolve_token(cli_token: Option<String>, config: &Config) -> Result<String> {
    cli_token
        .or_else(|| config.auth.token.clone())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "API token required. Run 'hixtunnel auth --token <TOKEN>', use --token, \n\
                 or set the HIXTUNNEL_API_TOKEN environment variable."
            )
        })
}

async fn run_start(
    cli_token: Option<String>,
    cli_server: Option<&str>,
    args: StartArgs,
    config: Config,
) -> Result<()> {
    let token = resolve_token(cli_token, &config)?;
    let server = config.server_url(cli_server);

    let broker = ControlClient::new(&server, token)?;
    let options = TunnelOptions {
        protocol: args.protocol,
        local_host: args.host,
        local_port: args.port,
    };

    println!(
        "Starting {} tunnel to {}:{} via {}",
        options.protocol, options.local_host, options.local_port, server
    );

    let controller = Controller::new(broker, options, config.relay);
    let signals = client::spawn_signal_listener(controller.cancel_token());

    let mut state = controller.subscribe();
    let watcher = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            if *state.borrow_and_update() == LifecycleState::Stopping {
                println!("Stopping tunnel...");
            }
        }
    });

    let mut link = controller.subscribe_session();
    let link_watcher = tokio::spawn(async move {
        let mut was_open = false;
        while link.changed().await.is_ok() {
            match *link.borrow_and_update() {
                SessionState::Open => was_open = true,
                SessionState::Connecting if was_open => println!("Reconnecting to broker..."),
                _ => {}
            }
        }
    });

    let result = controller.run().await;
    signals.abort();
    let _ = watcher.await;
    let _ = link_watcher.await;

    result?;
    println!("Tunnel closed.");
    Ok(())
}

async fn run_stop(
    cli_token: Option<String>,
    cli_server: Option<&str>,
    tunnel_id: String,
    config: &Config,
) -> Result<()> {
    let token = resolve_token(cli_token, config)?;
    let broker = ControlClient::new(&config.server_url(cli_server), token)?;

    let id = TunnelId(tunnel_id);
    broker
        .stop_tunnel(&id)
        .await
        .with_context(|| format!("Failed to stop tunnel {}", id))?;

    println!("Tunnel {} stopped", id);
    Ok(())
}

fn run_auth(token: Option<String>, server: Option<&str>) -> Result<()> {
    if token.is_none() && server.is_none() {
        anyhow::bail!("Nothing to save. Pass --token <TOKEN> and/or --server <URL>");
    }

    let mut config = Config::load().unwrap_or_default();
    if let Some(token) = token {
        let token = token.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("No token provided");
        }
        config.auth.token = Some(token);
    }
    if let Some(server) = server {
        config.auth.server = Some(normalize_server(server));
    }
    config.save()?;

    println!(
        "Credentials saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: hixtunnel start -P http -p <port>");

    Ok(())
}

fn run_config(cli_server: Option<&str>, config: &Config) -> Result<()> {
    println!("Config file: {:?}", Config::config_path()?);
    println!("Server:      {}", config.server_url(cli_server));
    println!(
        "Token:       {}",
        config
            .auth
            .token
            .as_deref()
            .map(mask_token)
            .unwrap_or_else(|| "(not set)".to_string())
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
