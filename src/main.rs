use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use vcluster_orchestrator::config::{Settings, load_env_file};
use vcluster_orchestrator::logging::init_tracing;
use vcluster_orchestrator::providers::HistoryStore;
use vcluster_orchestrator::providers::fs::FsHistoryStore;
use vcluster_orchestrator::provisioning::{ActionTrigger, GithubActionTrigger};
use vcluster_orchestrator::server;
use vcluster_orchestrator::service::ProvisioningService;

#[derive(Parser)]
#[command(name = "vcluster-orchestrator")]
#[command(about = "Durable vCluster provisioning driven by GitHub Actions pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP intake and the orchestration runtime
    Serve {
        /// TOML file with settings; environment variables take precedence
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to listen on (overrides LISTEN_ADDR)
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Directory for durable history (overrides STORE_DIR)
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Load and validate settings, then exit
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            store_dir,
        } => {
            let mut settings = load_settings(config)?;
            if let Some(addr) = listen {
                settings.server.listen_addr = addr;
            }
            if let Some(dir) = store_dir {
                settings.server.store_dir = dir;
            }
            serve(settings).await
        }
        Commands::CheckConfig { config } => {
            let settings = load_settings(config)?;
            println!("configuration ok: {:#?}", settings);
            Ok(())
        }
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let settings = Settings::load(path.as_deref()).context("failed to load settings")?;
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

async fn serve(settings: Settings) -> Result<()> {
    std::fs::create_dir_all(&settings.server.store_dir)
        .with_context(|| format!("failed to create store dir {}", settings.server.store_dir.display()))?;
    let store: Arc<dyn HistoryStore> = Arc::new(FsHistoryStore::new(&settings.server.store_dir, false));
    let trigger: Arc<dyn ActionTrigger> =
        Arc::new(GithubActionTrigger::new(settings.github.clone()).context("failed to build GitHub client")?);

    let service = Arc::new(
        ProvisioningService::start(store, trigger, settings.activity_options(), settings.orchestration).await,
    );
    info!(
        store = %settings.server.store_dir.display(),
        completion_timeout_ms = settings.orchestration.completion_timeout_ms,
        max_create_attempts = settings.orchestration.max_create_attempts,
        "provisioning service started"
    );

    let result = server::serve(service.clone(), settings.server.listen_addr).await;
    service.shutdown().await;
    result.context("HTTP server failed")
}
