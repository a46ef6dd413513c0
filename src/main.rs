//! Remote Admin CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remote_admin::config::CONFIG_FILE_ENV;
use remote_admin::{
    run_server, AppState, Claims, CommandRequest, JwtVerifier, ServerConfig, StatusAggregator,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "remote-admin", version, about = "Remote host administration service")]
struct Cli {
    /// YAML config file
    #[arg(long, global = true, env = CONFIG_FILE_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },

    /// Run one command through the gateway on this host
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print a status snapshot as JSON
    Status,

    /// List the allowed verbs
    Allowlist {
        /// Print as an allowlist file that ALLOWLIST_FILE can load
        #[arg(long)]
        yaml: bool,
    },

    /// Issue a bearer token signed with the configured secret
    Token {
        #[arg(long)]
        sub: String,

        #[arg(long, default_value = "admin")]
        role: String,

        /// Lifetime in seconds; 0 issues a token without expiry
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    remote_admin::init_logging();

    let cli = Cli::parse();
    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Serve { port, host } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(host) = host {
                config.host = host;
            }

            info!(version = remote_admin::VERSION, "Starting remote-admin");
            run_server(config).await
        }
        Command::Exec { command } => exec(&config, &command.join(" ")).await,
        Command::Status => {
            let snapshot = StatusAggregator::default().collect().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Allowlist { yaml } => {
            let allowlist = config.load_allowlist()?;
            if yaml {
                print!("{}", allowlist.to_yaml()?);
                return Ok(());
            }

            println!("Allowed verbs ({}):", allowlist.len());
            for entry in allowlist.entries() {
                println!(
                    "  {} - {}",
                    entry.verb,
                    entry.description.as_deref().unwrap_or("No description")
                );
            }
            Ok(())
        }
        Command::Token { sub, role, ttl_secs } => {
            let mut claims = Claims::new(sub, role);
            if ttl_secs > 0 {
                claims = claims.expires_at(chrono::Utc::now().timestamp() + ttl_secs);
            }
            let token = JwtVerifier::new(&config.jwt_secret).sign(&claims)?;
            println!("{}", token);
            Ok(())
        }
    }
}

async fn exec(config: &ServerConfig, command: &str) -> Result<()> {
    let state = AppState::from_config(config)?;

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = state
        .gateway
        .execute(&CommandRequest::new(command), &shutdown)
        .await?;

    print!("{}", result.output);
    if let Some(error) = &result.error {
        eprintln!("error: {}", error);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
