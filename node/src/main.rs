use anyhow::Context;
use clap::Parser;
use liftoff_execution::{Ledger, Memory, SolvencyGuard};
use liftoff_gateway::{Api, RealtimeHub};
use liftoff_node::{
    backend::Game,
    cashier::Cashier,
    chain::{Chain, DevSigner, Simulated},
    deposits::DepositIndexer,
    engine::Actor,
    monitor::Monitor,
    payout::PayoutSender,
    Config,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative liftoff game server.", long_about = None)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Load config
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("could not read {}", args.config.display()))?;
    let config: Config = serde_yaml::from_str(&raw).context("could not parse config file")?;
    let config = config.validate().context("invalid config")?;

    // Create logger
    let subscriber = tracing_subscriber::fmt().with_max_level(config.log_level);
    if config.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let (shutdown, stopped) = watch::channel(false);

    // Start devnet chain
    let chain = Simulated::new(config.devnet.gas_price);
    chain.fund(&config.hot_wallet, config.devnet.house_funds);
    for wallet in &config.devnet.faucet {
        chain.push_transfer(wallet, &config.deposits.address, config.devnet.faucet_amount);
    }
    let miner = {
        let chain = chain.clone();
        let mut stopped = stopped.clone();
        let block_time = Duration::from_millis(config.devnet.block_time_ms);
        tokio::spawn(async move {
            let mut blocks = tokio::time::interval(block_time);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = blocks.tick() => {
                        chain.mine();
                    },
                }
            }
        })
    };
    info!(
        hot_wallet = %config.hot_wallet,
        deposits = %config.deposits.address,
        faucet = config.devnet.faucet.len(),
        "devnet started"
    );

    // Create ledger and payouts
    let ledger = Ledger::with_attempts(Memory::default(), config.ledger_attempts);
    let sender = Arc::new(PayoutSender::new(
        chain.clone(),
        DevSigner::new(&config.hot_wallet),
        config.payout.clone(),
    ));
    sender
        .init()
        .await
        .context("failed to initialize payout nonce")?;
    let cashier = Cashier::new(ledger.clone(), sender);

    // Size the bankroll
    let house_funds = chain
        .balance(&config.hot_wallet)
        .await
        .context("failed to read house funds")?;
    let solvency = Arc::new(SolvencyGuard::new(config.solvency.clone(), house_funds));

    // Start round engine
    let hub = Arc::new(RealtimeHub::new(config.event_buffer));
    let (actor, mailbox) = Actor::new(
        config.engine.clone(),
        ledger.clone(),
        solvency.clone(),
        hub.clone(),
        StdRng::from_entropy(),
        stopped.clone(),
    );
    let engine = actor.start();

    // Start deposit indexer
    let indexer = Arc::new(DepositIndexer::new(
        chain.clone(),
        ledger.clone(),
        config.deposits.clone(),
    ));
    let poller = {
        let indexer = indexer.clone();
        let stopped = stopped.clone();
        tokio::spawn(async move { indexer.run(stopped).await })
    };
    let watcher = config.watch_heads.then(|| {
        let indexer = indexer.clone();
        let stopped = stopped.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.watch(stopped).await {
                warn!(?e, "new head watcher stopped");
            }
        })
    });

    // Start monitors
    let monitor = Monitor::new(
        config.monitor.clone(),
        ledger.clone(),
        chain.clone(),
        cashier.clone(),
        solvency,
    );
    let monitors = {
        let stopped = stopped.clone();
        tokio::spawn(async move { monitor.run(stopped).await })
    };

    // Start gateway
    let api = Api::new(
        config.gateway.clone(),
        hub,
        Game::new(mailbox, cashier, ledger),
    );
    let app = api.router().context("failed to build router")?;
    let maintenance = api.spawn_maintenance(stopped);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "failed to listen for shutdown signal");
        }
        info!("shutting down");
        let _ = shutdown.send(true);
    })
    .await
    .context("axum server error")?;

    // Wait for background tasks
    let mut tasks = vec![miner, engine, poller, monitors, maintenance];
    tasks.extend(watcher);
    for task in tasks {
        if let Err(e) = task.await {
            error!(?e, "task failed");
        }
    }
    Ok(())
}
