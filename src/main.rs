use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use ledgerforge::config::loader::{load_config_from_file, load_global_config};
use ledgerforge::families::{self, ethclassic};
use ledgerforge::log_collector::{self, get_default_logs_path, LogCollector};
use ledgerforge::{
    BuildDriver, BuildEvent, KeyPool, LocalExecutor, Network, NetworkSpec, StrategyRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("usage: {} <network.json> [engine.json|engine.toml]", args[0]);
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    let config = match args.get(2) {
        Some(path) => load_config_from_file(&PathBuf::from(path))
            .with_context(|| format!("loading engine config {}", path))?,
        None => load_global_config().context("loading global engine config")?,
    };

    // =========================================================================
    // LOGGING INITIALIZATION
    // =========================================================================
    let log_dir = match config.log_dir {
        Some(ref dir) => dir.clone(),
        None => get_default_logs_path().context("resolving logs directory")?,
    };
    let collector = LogCollector::new(&log_dir).context("starting log collector")?;
    let flusher = collector.clone();
    if let Err(e) = log_collector::install(collector, log::LevelFilter::Info) {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    log::info!("ledgerforge {} starting", ledgerforge::VERSION);

    // =========================================================================
    // NETWORK DESCRIPTION
    // =========================================================================
    let spec_path = PathBuf::from(&args[1]);
    let spec: NetworkSpec = serde_json::from_str(
        &std::fs::read_to_string(&spec_path)
            .with_context(|| format!("reading {}", spec_path.display()))?,
    )
    .with_context(|| format!("parsing {}", spec_path.display()))?;

    let mut network = Network::new(spec.parameter_set());
    for host in &spec.hosts {
        network.add_host(Arc::new(LocalExecutor::new(
            host.id.clone(),
            config.container_prefix.clone(),
        )));
    }
    for node in &spec.nodes {
        network.push_node(node.address.clone(), node.host.clone());
    }

    // =========================================================================
    // REGISTRY, KEYS AND DRIVER
    // =========================================================================
    let registry = StrategyRegistry::new();
    families::register_all(&registry)?;

    let strategy = registry.require(&spec.family)?;
    let key_pool = match config.key_pool_dir {
        Some(ref dir) => KeyPool::from_resource_dir(dir, strategy.name())?,
        None => KeyPool::empty(),
    }
    .with_generator(ethclassic::key_generator);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling build");
            let _ = cancel_tx.send(true);
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel::<BuildEvent>(1024);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                BuildEvent::Progress { completed, total } => eprintln!("[{}/{}]", completed, total),
                BuildEvent::StageChanged(stage) => eprintln!("==> {}", stage),
            }
        }
    });

    let driver = BuildDriver::new(Arc::new(registry), config, cancel_rx)
        .with_events(event_tx)
        .with_key_pool(key_pool);

    // =========================================================================
    // BUILD
    // =========================================================================
    let outcome = driver.build(&network).await;
    let _ = flusher.wait_for_empty();
    let state = outcome.into_result().context("build failed")?;

    let report = serde_json::json!({
        "build": state.snapshot(),
        "external": state.external(),
        "services": strategy.services(),
        "sidecars": strategy.sidecars(&network),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
