use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use libvbox::{
    Collaborators, HttpIdentity, HttpObjectStore, HttpSuggestionClient, LifecycleCoordinator,
    PtyLauncher, ShellCommand, SuggestionService,
};
use vbox_server::config::ServerConfig;
use vbox_server::{AppState, app, build_cors};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "vbox-server", about = "Collaborative sandbox session coordinator")]
struct Args {
    /// Config file (default: ~/.config/vbox/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Allowed CORS origin, repeatable ("*" allows any)
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,

    /// Object storage worker base URL
    #[arg(long)]
    storage_url: Option<String>,

    /// Database worker base URL
    #[arg(long)]
    database_url: Option<String>,

    /// Code generation endpoint
    #[arg(long)]
    ai_url: Option<String>,

    /// Parent directory of on-disk box mirrors
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Keep box files only in memory and storage
    #[arg(long)]
    no_projection: bool,

    /// Shell program for new terminals
    #[arg(long)]
    shell: Option<String>,

    /// Terminals allowed per box
    #[arg(long)]
    max_terminals: Option<usize>,

    /// Seconds a box without clients keeps its state
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.allow_origins.is_empty() {
            config.allow_origins = self.allow_origins;
        }
        if let Some(url) = self.storage_url {
            config.storage_url = url;
        }
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if let Some(url) = self.ai_url {
            config.ai_url = Some(url);
        }
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
        if self.no_projection {
            config.projection = false;
        }
        if let Some(program) = self.shell {
            config.shell = ShellCommand {
                program,
                args: Vec::new(),
            };
        }
        if let Some(n) = self.max_terminals {
            config.max_terminals = n;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vbox_server=info,libvbox=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let collaborators = collaborators(&config)?;
    let coordinator = LifecycleCoordinator::new(config.coordinator_config(), collaborators);
    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        max_frame_bytes: config.frame_limit(),
    });
    let router = app(state, build_cors(&config.allow_origins)?);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;
    tracing::info!("vbox-server listening on http://{}", config.listen);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    tracing::info!("vbox-server stopped");
    Ok(())
}

fn collaborators(config: &ServerConfig) -> Result<Collaborators> {
    let client = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let suggestions: Option<Arc<dyn SuggestionService>> = match &config.ai_url {
        Some(url) => {
            let token = config.ai_token.clone().unwrap_or_default();
            if token.is_empty() {
                tracing::warn!("ai_url set without a token; requests will be unauthenticated");
            }
            Some(Arc::new(HttpSuggestionClient::new(client.clone(), url, token)))
        }
        None => {
            tracing::info!("code generation disabled (no ai_url)");
            None
        }
    };

    Ok(Collaborators {
        store: Arc::new(HttpObjectStore::new(client.clone(), &config.storage_url)),
        identity: Arc::new(HttpIdentity::new(client, &config.database_url)),
        suggestions,
        launcher: Arc::new(PtyLauncher),
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
