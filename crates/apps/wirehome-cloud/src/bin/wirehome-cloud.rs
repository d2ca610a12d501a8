use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wirehome_cloud::auth::password::hash_password;
use wirehome_cloud::auth::repository::FileIdentityRepository;
use wirehome_cloud::auth::token::SessionTokens;
use wirehome_cloud::auth::AuthorizationService;
use wirehome_cloud::config::RelayConfig;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "wirehome-cloud", about = "Wirehome cloud relay")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default).
    Run {
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
        #[arg(long)]
        identities_dir: Option<PathBuf>,
    },
    /// Read a password from stdin and print its hash.
    HashPassword,
    /// Read a password from stdin and store it for an existing identity.
    SetPassword { identity_uid: String },
}

fn read_password() -> anyhow::Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line).context("reading password from stdin")?;
    let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    anyhow::ensure!(!trimmed.is_empty(), "empty password");
    Ok(trimmed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RelayConfig::default(),
    };

    match args.command.unwrap_or(Command::Run { bind: None, identities_dir: None }) {
        Command::HashPassword => {
            let password = read_password()?;
            println!("{}", hash_password(&password).map_err(|err| anyhow::anyhow!("{err}"))?);
            Ok(())
        }
        Command::SetPassword { identity_uid } => {
            let password = read_password()?;
            let authorization = AuthorizationService::new(
                Arc::new(FileIdentityRepository::new(&config.identities_dir)),
                SessionTokens::ephemeral(config.session_ttl()),
            );
            authorization
                .set_password(&identity_uid, &password)
                .await
                .with_context(|| format!("updating identity '{identity_uid}'"))?;
            log::info!("relay: password updated for '{identity_uid}'");
            Ok(())
        }
        Command::Run { bind, identities_dir } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(dir) = identities_dir {
                config.identities_dir = dir;
            }

            let shutdown = CancellationToken::new();
            let state = wirehome_cloud::build_state(&config, shutdown.clone());
            let listener = TcpListener::bind(config.bind)
                .await
                .with_context(|| format!("binding {}", config.bind))?;
            log::info!("relay: listening on {}", config.bind);

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("relay: shutting down");
                    shutdown.cancel();
                }
            });
            wirehome_cloud::server::serve(listener, state).await?;
            Ok(())
        }
    }
}
