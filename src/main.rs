//! filemesh CLI
//!
//! `filemesh start tracker,indexserver,peer` runs the selected roles in the
//! foreground until SIGINT or a POST to /shutdown on the health port.
//! `status` and `stop` talk to a running node over its health endpoint.
//! Any `--key=value` argument (dotted key) overrides configuration;
//! `--config.file=<path>` selects a TOML config file.
//!
//! Exit codes: 0 success, 1 cycle or unrecoverable startup failure, 2 bad
//! arguments.

use axum::routing::post;
use clap::{Parser, Subcommand};
use filemesh::bootstrap::{Bootstrap, BootstrapError, Context, ServiceFuture, ServiceKind};
use filemesh::config::ConfigStore;
use filemesh::health::health_router;
use filemesh::index::{IndexConfig, IndexServer};
use filemesh::peer::{PeerConfig, PeerNode};
use filemesh::tracker::{TrackerConfig, TrackerServer};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "filemesh", version, about = "Peer-to-peer file sharing overlay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run components in the foreground (comma-separated subset of
    /// tracker, indexserver, peer, all)
    Start { components: String },
    /// Ask a running node to shut down
    Stop { components: String },
    /// Show a running node's health
    Status,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Dotted --key=value arguments are configuration, not clap flags
    let (overrides, args): (Vec<String>, Vec<String>) = std::env::args().partition(|arg| {
        arg.strip_prefix("--")
            .and_then(|body| body.split_once('='))
            .map(|(key, _)| key.contains('.'))
            .unwrap_or(false)
    });

    let config = Arc::new(ConfigStore::new());
    for arg in &overrides {
        let body = arg.trim_start_matches("--");
        if let Some((key, value)) = body.split_once('=') {
            if key == "config.file" {
                if let Err(e) = config.load_file(value) {
                    eprintln!("filemesh: {e}");
                    return ExitCode::from(2);
                }
            } else {
                config.set(key, value);
            }
        }
    }

    let cli = Cli::parse_from(args);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("filemesh: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Start { components } => runtime.block_on(run_start(config, &components)),
        Command::Stop { components } => runtime.block_on(run_stop(config, &components)),
        Command::Status => runtime.block_on(run_status(config)),
    }
}

fn parse_components(raw: &str) -> Result<BTreeSet<&'static str>, String> {
    let mut selected = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part {
            "tracker" => {
                selected.insert("tracker");
            }
            "indexserver" => {
                selected.insert("indexserver");
            }
            "peer" => {
                selected.insert("peer");
            }
            "all" => {
                selected.extend(["tracker", "indexserver", "peer"]);
            }
            other => return Err(format!("unknown component '{other}'")),
        }
    }
    if selected.is_empty() {
        return Err("no components selected".to_string());
    }
    Ok(selected)
}

async fn run_start(config: Arc<ConfigStore>, components: &str) -> ExitCode {
    let selected = match parse_components(components) {
        Ok(selected) => selected,
        Err(e) => {
            eprintln!("filemesh: {e}");
            return ExitCode::from(2);
        }
    };

    let violations = config.validate();
    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("filemesh: config {}={}: {}", violation.key, violation.value, violation.message);
        }
        return ExitCode::from(2);
    }

    let context = Context::new(config.clone());
    let mut bootstrap = Bootstrap::new().with_start_timeout(
        config.get_secs("bootstrap.startup.timeout.seconds", Duration::from_secs(30)),
    );
    if config.get_bool("bootstrap.dynamic.ports", false) {
        bootstrap = bootstrap.with_dynamic_ports(config.clone());
    }

    // Health endpoint, with the shutdown control route
    if config.get_bool("healthcheck.enabled", true) {
        let health = context.health.clone();
        let shutdown = context.shutdown.clone();
        let token = context.shutdown_token();
        let port = config.get_port("healthcheck.port", 8080);
        bootstrap
            .register_service(
                "health",
                move || {
                    let health = health.clone();
                    let shutdown = shutdown.clone();
                    let token = token.clone();
                    Box::pin(async move {
                        let listener =
                            tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
                        let addr = listener.local_addr()?;
                        let control = shutdown.clone();
                        let app = health_router(health).route(
                            "/shutdown",
                            post(move || {
                                let control = control.clone();
                                async move {
                                    control.shutdown();
                                    "shutting down\n"
                                }
                            }),
                        );
                        tokio::spawn(async move {
                            let server = axum::serve(listener, app).with_graceful_shutdown(
                                async move { token.cancelled().await },
                            );
                            if let Err(e) = server.await {
                                tracing::error!(error = %e, "health endpoint failed");
                            }
                        });
                        tracing::info!(%addr, "health endpoint listening");
                        Ok(())
                    }) as ServiceFuture
                },
                || Box::pin(async { Ok(()) }) as ServiceFuture,
            )
            .expect("unique service name");
    }

    // Discovery backend
    {
        let registry = context.registry.clone();
        let stop_registry = context.registry.clone();
        bootstrap
            .register_service(
                "registry",
                move || {
                    let registry = registry.clone();
                    Box::pin(async move {
                        registry.start().await?;
                        Ok(())
                    }) as ServiceFuture
                },
                move || {
                    let registry = stop_registry.clone();
                    Box::pin(async move {
                        registry.stop().await;
                        Ok(())
                    }) as ServiceFuture
                },
            )
            .expect("unique service name");
    }

    // Servers are constructed inside their start closures so dynamic-port
    // allocation (which rewrites config just before start) is honored; the
    // stop closure reaches the instance through a shared slot.
    if selected.contains("tracker") {
        let slot: Arc<tokio::sync::Mutex<Option<Arc<TrackerServer>>>> = Arc::default();
        let start_slot = slot.clone();
        let start_config = config.clone();
        let start_context = context.clone();
        let token = context.shutdown_token();
        bootstrap
            .register_typed_service(
                "tracker",
                ServiceKind::Tracker,
                move || {
                    let slot = start_slot.clone();
                    let config = start_config.clone();
                    let context = start_context.clone();
                    let token = token.clone();
                    Box::pin(async move {
                        let tracker = TrackerServer::new(
                            TrackerConfig::from_config(&config),
                            context.health.clone(),
                            context.metrics.clone(),
                            context.registry.clone(),
                        );
                        tracker.start(token).await?;
                        *slot.lock().await = Some(tracker);
                        Ok(())
                    }) as ServiceFuture
                },
                move || {
                    let slot = slot.clone();
                    Box::pin(async move {
                        if let Some(tracker) = slot.lock().await.take() {
                            tracker.stop().await;
                        }
                        Ok(())
                    }) as ServiceFuture
                },
            )
            .expect("unique service name");
        bootstrap.add_dependency("tracker", "registry").expect("registered");
    }

    if selected.contains("indexserver") {
        let slot: Arc<tokio::sync::Mutex<Option<Arc<IndexServer>>>> = Arc::default();
        let start_slot = slot.clone();
        let start_config = config.clone();
        let start_context = context.clone();
        let token = context.shutdown_token();
        bootstrap
            .register_typed_service(
                "indexserver",
                ServiceKind::IndexServer,
                move || {
                    let slot = start_slot.clone();
                    let config = start_config.clone();
                    let context = start_context.clone();
                    let token = token.clone();
                    Box::pin(async move {
                        let index = IndexServer::new(
                            IndexConfig::from_config(&config),
                            context.health.clone(),
                            context.metrics.clone(),
                            context.registry.clone(),
                        );
                        index.start(token).await?;
                        *slot.lock().await = Some(index);
                        Ok(())
                    }) as ServiceFuture
                },
                move || {
                    let slot = slot.clone();
                    Box::pin(async move {
                        if let Some(index) = slot.lock().await.take() {
                            index.stop().await;
                        }
                        Ok(())
                    }) as ServiceFuture
                },
            )
            .expect("unique service name");
        bootstrap.add_dependency("indexserver", "registry").expect("registered");
    }

    if selected.contains("peer") {
        let slot: Arc<tokio::sync::Mutex<Option<Arc<PeerNode>>>> = Arc::default();
        let start_slot = slot.clone();
        let start_config = config.clone();
        bootstrap
            .register_typed_service(
                "peer",
                ServiceKind::Peer,
                move || {
                    let slot = start_slot.clone();
                    let config = start_config.clone();
                    Box::pin(async move {
                        let peer_id =
                            config.get_string("peer.id", &format!("peer-{}", short_id()));
                        let peer = PeerNode::new(PeerConfig::from_config(&config, peer_id));
                        peer.start().await?;
                        let shared_dir = config.get_string("peer.shared.dir", "");
                        if !shared_dir.is_empty() {
                            share_directory(&peer, &shared_dir).await;
                        }
                        *slot.lock().await = Some(peer);
                        Ok(())
                    }) as ServiceFuture
                },
                move || {
                    let slot = slot.clone();
                    Box::pin(async move {
                        if let Some(peer) = slot.lock().await.take() {
                            peer.stop(Duration::from_secs(5)).await;
                        }
                        Ok(())
                    }) as ServiceFuture
                },
            )
            .expect("unique service name");
        for prerequisite in ["tracker", "indexserver"] {
            if selected.contains(prerequisite) {
                bootstrap.add_dependency("peer", prerequisite).expect("registered");
            }
        }
    }

    if let Err(e) = bootstrap.start().await {
        match &e {
            BootstrapError::CircularDependency { .. } => {
                eprintln!("filemesh: {e}");
                for cycle in e.formatted_cycles() {
                    eprintln!("  cycle: {cycle}");
                }
            }
            other => eprintln!("filemesh: {other}"),
        }
        return ExitCode::from(1);
    }

    tracing::info!(components = %components, "filemesh running; Ctrl-C or POST /shutdown to stop");

    let token = context.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = token.cancelled() => tracing::info!("shutdown requested"),
    }

    context.shutdown.shutdown();
    bootstrap.shutdown().await;
    context.tasks.shutdown_all(Duration::from_secs(5)).await;
    ExitCode::SUCCESS
}

async fn share_directory(peer: &PeerNode, dir: &str) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir, error = %e, "cannot read shared directory");
            return;
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if let Err(e) = peer.share_file(&name, path).await {
            tracing::warn!(file = %name, error = %e, "could not share file");
        }
    }
}

async fn run_stop(config: Arc<ConfigStore>, components: &str) -> ExitCode {
    if let Err(e) = parse_components(components) {
        eprintln!("filemesh: {e}");
        return ExitCode::from(2);
    }
    let port = config.get_port("healthcheck.port", 8080);
    let url = format!("http://127.0.0.1:{port}/shutdown");
    match reqwest::Client::new().post(&url).send().await {
        Ok(response) if response.status().is_success() => {
            println!("shutdown requested");
            ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("filemesh: node answered {}", response.status());
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("filemesh: no node reachable at {url}: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run_status(config: Arc<ConfigStore>) -> ExitCode {
    let port = config.get_port("healthcheck.port", 8080);
    let url = format!("http://127.0.0.1:{port}/health");
    match reqwest::get(&url).await {
        Ok(response) => match response.json::<serde_json::Value>().await {
            Ok(body) => {
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("filemesh: bad health response: {e}");
                ExitCode::from(1)
            }
        },
        Err(e) => {
            eprintln!("filemesh: no node reachable at {url}: {e}");
            ExitCode::from(1)
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string().chars().take(8).collect()
}
