use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use wirehome_agent::handlers::{StatusRawHandler, STATUS_RAW_TYPE};
use wirehome_agent::{
    AgentConfig, AgentRequestHandler, CloudAgent, RawHandlerRegistry, ReqwestHttpHandler,
    WebSocketConnector,
};

#[derive(Parser, Debug)]
#[command(name = "wirehome-agent", about = "Connects a Wirehome device to the cloud relay")]
struct Args {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long)]
    channel: Option<String>,
    #[arg(long)]
    local_http_url: Option<String>,
    /// Timeout for calls into the local HTTP API, in seconds.
    #[arg(long, default_value_t = 60)]
    local_http_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = AgentConfig::from_path(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(url) = args.relay_url {
        config.relay_url = url;
    }
    if let Some(channel) = args.channel {
        config.channel_uid = channel;
    }
    if let Some(url) = args.local_http_url {
        config.local_http_url = url;
    }

    let local_http = ReqwestHttpHandler::new(
        config.local_http_url.clone(),
        Duration::from_secs(args.local_http_timeout),
    )?;
    let raw = Arc::new(RawHandlerRegistry::new());
    raw.register(STATUS_RAW_TYPE, Arc::new(StatusRawHandler));
    let handler = AgentRequestHandler::new(Arc::new(local_http), raw);
    let connector = Arc::new(WebSocketConnector::new(config.relay_url.clone()));
    let agent = CloudAgent::new(config, connector, handler);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("agent: shutting down");
            signal.cancel();
        }
    });

    agent.run(shutdown).await?;
    Ok(())
}
