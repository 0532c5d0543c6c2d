#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use daze_lib::config::{
    load_from_path, Config, FileConfig, Overrides, Protocol, Role, RoutingMode,
};
use daze_lib::run;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Daze local-to-remote tunnelling system")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the remote relay
    Server(ServerArgs),
    /// Run the local agent
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Configuration TOML file; explicit flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Listen address
    #[arg(short = 'l', long, value_name = "HOST:PORT")]
    listen: Option<String>,
    /// Pre-shared password
    #[arg(short = 'k', long)]
    password: Option<String>,
    /// Tunnel protocol: ashe, baboon or czar
    #[arg(long, value_parser = Protocol::from_str)]
    protocol: Option<Protocol>,
    /// Masker site for unauthorized masquerade requests
    #[arg(long, value_name = "URL")]
    masker: Option<String>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Configuration TOML file; explicit flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Local listen address
    #[arg(short = 'l', long, value_name = "HOST:PORT")]
    listen: Option<String>,
    /// Relay address to tunnel through
    #[arg(short = 's', long, value_name = "HOST:PORT")]
    server: Option<String>,
    /// Pre-shared password
    #[arg(short = 'k', long)]
    password: Option<String>,
    /// Tunnel protocol: ashe, baboon or czar
    #[arg(long, value_parser = Protocol::from_str)]
    protocol: Option<Protocol>,
    /// Routing mode: rule, remote or locale
    #[arg(long, value_parser = RoutingMode::from_str)]
    mode: Option<RoutingMode>,
    /// Rule file (L/R/B glob directives)
    #[arg(long, value_name = "FILE")]
    rule: Option<String>,
    /// CIDR file with the same grammar
    #[arg(long, value_name = "FILE")]
    cidr: Option<String>,
    /// Use the public resolver instead of the system one
    #[arg(long)]
    android: bool,
}

fn load_file(path: Option<&PathBuf>) -> FileConfig {
    match path {
        Some(p) => match load_from_path(p) {
            Ok(file) => file,
            Err(err) => {
                error!(%err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => FileConfig::default(),
    }
}

fn resolve(cli: Cli) -> daze_lib::Result<Config> {
    match cli.command {
        Command::Server(args) => {
            let file = load_file(args.config.as_ref());
            let flags = Overrides {
                listen: args.listen,
                password: args.password,
                protocol: args.protocol,
                masker: args.masker,
                ..Overrides::default()
            };
            file.resolve(Role::Server, flags)
        }
        Command::Client(args) => {
            let file = load_file(args.config.as_ref());
            let flags = Overrides {
                listen: args.listen,
                server: args.server,
                password: args.password,
                protocol: args.protocol,
                mode: args.mode,
                rule_file: args.rule,
                cidr_file: args.cidr,
                android: args.android,
                ..Overrides::default()
            };
            file.resolve(Role::Client, flags)
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cfg = match resolve(Cli::parse()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(listen = %cfg.listen, role = ?cfg.role, "configuration loaded");

    let serve = async {
        match cfg.role {
            Role::Client => run::client(cfg).await,
            Role::Server => run::server(cfg).await,
        }
    };
    tokio::select! {
        res = serve => {
            if let Err(err) = res {
                error!(%err, "exited with error");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
