use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use cors_gateway::{Config, Gateway, serve, shutdown_signal};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./serverconfig.yml";

/// CORS-bypassing HTTP gateway
#[derive(Parser, Debug)]
#[command(name = "cors-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Credentials file mapping upstream hosts to auth settings
    #[arg(long)]
    proxy_auth: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!(%e, "fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> cors_gateway::Result<()> {
    let mut config = if args.config.as_os_str() == DEFAULT_CONFIG_PATH && !args.config.exists() {
        warn!(path = %args.config.display(), "config file not found, using defaults");
        Config::default()
    } else {
        Config::load_from_file(&args.config)?
    };

    if let Some(path) = &args.proxy_auth {
        let proxy_auth = Config::load_proxy_auth(path)?;
        if !proxy_auth.is_empty() {
            info!(path = %path.display(), hosts = proxy_auth.len(), "loaded proxy auth file");
            config.proxy_auth = proxy_auth;
        }
    }

    let mut runtime = config.into_runtime()?;
    if let Some(port) = args.port {
        runtime.listen.set_port(port);
    }

    let runtime = Arc::new(runtime);
    let gateway = Arc::new(Gateway::new(Arc::clone(&runtime))?);

    let listener = TcpListener::bind(runtime.listen).await.map_err(|e| {
        cors_gateway::ProxyError::Config(format!("failed to bind {}: {e}", runtime.listen))
    })?;

    info!(
        addr = %runtime.listen,
        prefix = %runtime.proxy_prefix,
        proxy_all_domains = runtime.proxy_all_domains,
        "listening"
    );

    serve(listener, gateway, shutdown_signal()).await;
    Ok(())
}
