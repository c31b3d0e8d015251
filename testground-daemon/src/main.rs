//! Testground daemon - controller and sidecar entrypoint
//!
//! Subcommands:
//! - `daemon`: the controller process (HTTP surface, task engine,
//!   orchestrator, coordination service)
//! - `sidecar`: the per-host data-plane manager for container backends
//! - `sync-service`: the coordination service standalone, for hosts
//!   that only need the substrate

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use testground::builder::BuilderRegistry;
use testground::config::EnvConfig;
use testground::daemon::{self, App};
use testground::docker::HttpContainerApi;
use testground::engine::Engine;
use testground::k8s::{ClientPool, HttpClusterApi, DEFAULT_POOL_SIZE};
use testground::logging;
use testground::rpc::OutputWriter;
use testground::runner::{
    ClusterRunner, ContainerRunner, ProcessRunner, RunnerRegistry,
};
use testground::sidecar::{run_sidecar, SidecarConfig, SidecarMode};
use testground::sync::{serve_sync, SyncApi, SyncStore};
use testground::task::{TaskEngine, TaskStorage};

#[derive(Parser)]
#[command(name = "testground-daemon")]
#[command(version = testground::VERSION)]
#[command(about = "Testground controller daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller daemon
    Daemon {
        /// HTTP listen address
        #[arg(long)]
        listen: Option<String>,

        /// Daemon home directory (default: ~/.testground)
        #[arg(long)]
        home: Option<String>,
    },

    /// Start the per-host sidecar
    Sidecar {
        /// Backend to serve: docker or k8s
        #[arg(long, default_value = "docker")]
        runner: String,

        /// Coordination service endpoint
        #[arg(long)]
        sync_endpoint: Option<String>,

        /// Host path to CNI plugin binaries
        #[arg(long, default_value = "/host/opt/cni/bin")]
        cni_path: String,
    },

    /// Start the coordination service on its own
    SyncService {
        /// HTTP listen address
        #[arg(long)]
        listen: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    if let Err(err) = runtime.block_on(run(cli)) {
        error!(%err, "fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                shutdown.cancel();
            }
        });
    }

    match cli.command {
        Commands::Daemon { listen, home } => {
            let mut cfg = EnvConfig::default();
            if let Some(home) = home {
                cfg = cfg.with_home(home);
            }
            if let Some(listen) = listen {
                cfg = cfg.with_listen(listen);
            }
            cfg.dirs().ensure()?;

            let _guard = logging::init_logging(
                &cfg.dirs().home().join("logs"),
                logging::default_log_file(),
            )?;
            info!(version = testground::VERSION, "starting testground daemon");

            let storage = Arc::new(TaskStorage::open(&cfg.dirs().data().join("tasks.db"))?);
            let tasks = TaskEngine::new(storage);
            let sync = Arc::new(SyncStore::new());

            let mut runners = RunnerRegistry::new();
            runners.register(Arc::new(ProcessRunner::new(
                cfg.dirs().outputs(),
                cfg.sync_endpoint.clone(),
            )));
            runners.register(Arc::new(ContainerRunner::new(
                Arc::new(HttpContainerApi::new(&cfg.docker_endpoint)?),
                cfg.dirs().outputs(),
                cfg.sync_endpoint.clone(),
            )));
            runners.register(Arc::new(ClusterRunner::new(
                ClientPool::new(
                    Arc::new(HttpClusterApi::new(&cfg.cluster)?),
                    DEFAULT_POOL_SIZE,
                ),
                Arc::clone(&sync) as Arc<dyn SyncApi>,
                cfg.sync_endpoint.clone(),
            )));

            // Builders are external plug-ins; the registry starts empty
            // and deployments register theirs here.
            let builders = BuilderRegistry::new();

            let engine = Engine::new(
                cfg.clone(),
                tasks,
                runners,
                builders,
                Arc::clone(&sync),
            );
            engine.start(shutdown.clone())?;

            let app = Arc::new(App {
                engine: engine.clone(),
            });
            daemon::spawn_maintenance(Arc::clone(&app), shutdown.clone());

            // The coordination service listens on its own port so
            // instances reach it without touching the control surface.
            let sync_listen = cfg.sync_listen.clone();
            let sync_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_sync(sync, &sync_listen, sync_shutdown).await {
                    error!(%err, "sync service failed");
                }
            });

            daemon::serve(app, &cfg.listen, shutdown).await?;
        }

        Commands::Sidecar {
            runner,
            sync_endpoint,
            cni_path,
        } => {
            let cfg = EnvConfig::default();
            let _guard = logging::init_logging(
                &cfg.dirs().home().join("logs"),
                logging::default_log_file(),
            )?;

            let mode: SidecarMode = runner.parse()?;
            let sidecar_cfg = SidecarConfig {
                mode,
                docker_endpoint: cfg.docker_endpoint.clone(),
                sync_endpoint: std::env::var("SYNC_SERVICE_ENDPOINT")
                    .ok()
                    .or(sync_endpoint)
                    .unwrap_or_else(|| cfg.sync_endpoint.clone()),
                cni_path,
            };

            info!(?mode, "starting testground sidecar");
            run_sidecar(sidecar_cfg, OutputWriter::discard(), shutdown).await?;
        }

        Commands::SyncService { listen } => {
            let cfg = EnvConfig::default();
            let _guard = logging::init_logging(
                &cfg.dirs().home().join("logs"),
                logging::default_log_file(),
            )?;

            let listen = listen.unwrap_or(cfg.sync_listen);
            info!(%listen, "starting coordination service");
            serve_sync(Arc::new(SyncStore::new()), &listen, shutdown).await?;
        }
    }

    Ok(())
}
