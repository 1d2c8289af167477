use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mixclient::{
    ChainParams, Client, Denomination, DigestCrypto, HookAction, HookPoint, MemoryRelay,
    MixConfig, MixOutcome, NoopObserver, OutputCommitment, PairRequest, PeerId, PhaseBudgets,
    PhaseMessage, RunContext, RunObserver,
};
use rand::Rng;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    about = "Runs several in-process mixing clients against each other",
    author,
    version
)]
struct Cli {
    /// Number of clients (must be at least 2)
    #[arg(long = "peers", default_value_t = 4)]
    peers: usize,

    /// Minimum participants for a session to form
    #[arg(long = "min-participants", default_value_t = 3)]
    min_participants: usize,

    /// Time budget for each protocol phase, in milliseconds
    #[arg(long = "phase-ms", default_value_t = 500)]
    phase_ms: u64,

    /// Target block interval of the simulated chain, in seconds
    #[arg(long = "block-secs", default_value_t = 150)]
    block_secs: u64,

    /// Chain tip the clients start at
    #[arg(long = "tip", default_value_t = 1000)]
    tip: u32,

    /// Mixed denomination
    #[arg(long = "denomination", default_value_t = 100_000)]
    denomination: u64,

    /// Fault injected into the first client
    #[arg(long = "fault", value_enum, default_value = "none")]
    fault: FaultArg,

    /// Give up waiting for outcomes after this many seconds
    #[arg(long = "timeout-secs", default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FaultArg {
    None,
    CorruptCt,
    WithholdDc,
}

/// Misbehaves in the first epoch only, so the honest peers can finish without it.
struct Saboteur {
    fault: FaultArg,
}

impl RunObserver for Saboteur {
    fn before_run(&self, ctx: &RunContext) {
        if ctx.epoch == 0 {
            warn!("Client {:?} will inject {:?}", ctx.local, self.fault);
        }
    }

    fn before_publish(
        &self,
        point: HookPoint,
        ctx: &RunContext,
        message: &mut PhaseMessage,
    ) -> HookAction {
        if ctx.epoch != 0 {
            return HookAction::Continue;
        }
        match (self.fault, point) {
            (FaultArg::CorruptCt, HookPoint::BeforeCtPublish) => {
                message.payload.truncate(4);
                HookAction::Continue
            }
            (FaultArg::WithholdDc, HookPoint::BeforeDcPublish) => HookAction::Withhold,
            _ => HookAction::Continue,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Simulation failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), mixclient::MixError> {
    let config = MixConfig::new(
        cli.min_participants,
        PhaseBudgets::uniform(Duration::from_millis(cli.phase_ms)),
        ChainParams::new(Duration::from_secs(cli.block_secs)),
    )
    .with_pairing_interval(Duration::from_millis(cli.phase_ms));
    config.validate()?;

    let relay = MemoryRelay::new();
    let mut rng = rand::rng();
    let mut clients = Vec::with_capacity(cli.peers);
    let mut outcomes = Vec::with_capacity(cli.peers);
    let mut inbound = Vec::with_capacity(cli.peers);

    for i in 0..cli.peers {
        let local = PeerId(rng.random());
        let (handle, rx) = relay.connect(local);
        let observer: Arc<dyn RunObserver> = if i == 0 && cli.fault != FaultArg::None {
            Arc::new(Saboteur { fault: cli.fault })
        } else {
            Arc::new(NoopObserver)
        };
        let (client, outcome_rx) = Client::new(
            local,
            config.clone(),
            Arc::new(DigestCrypto),
            Arc::new(handle),
            observer,
        )?;
        client.set_tip(cli.tip).await;
        clients.push(client);
        outcomes.push(outcome_rx);
        inbound.push(rx);
    }

    // Exchange pair requests before anyone pairs, so every pool holds the same set.
    for client in &clients {
        let expiry = client.max_expiry().await;
        let request = PairRequest::new(
            *client.local(),
            vec![OutputCommitment(rng.random())],
            Denomination(cli.denomination),
            expiry,
        )?;
        client.submit(request).await?;
    }
    for (client, rx) in clients.iter().zip(inbound.iter_mut()) {
        while let Ok(message) = rx.try_recv() {
            if let Err(e) = client.receive(message).await {
                warn!("Client {:?} rejected message: {}", client.local(), e);
            }
        }
    }
    for (client, rx) in clients.iter().zip(inbound) {
        client.attach(rx);
        client.spawn_pairing_loop();
    }
    info!("{} clients submitted pair requests", clients.len());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.timeout_secs);
    for (client, rx) in clients.iter().zip(outcomes.iter_mut()) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(outcome)) => report(client, &outcome),
            Ok(None) => warn!("Client {:?} closed without an outcome", client.local()),
            Err(_) => warn!("Client {:?} produced no outcome in time", client.local()),
        }
    }
    Ok(())
}

fn report(client: &Client, outcome: &MixOutcome) {
    match outcome {
        MixOutcome::Completed {
            session_id,
            epoch,
            transaction,
            verdicts,
            ..
        } => println!(
            "{:?}: completed session {:?} at epoch {} after {} verdict(s), tx {}",
            client.local(),
            session_id,
            epoch,
            verdicts.len(),
            hex::encode(transaction.hash())
        ),
        MixOutcome::Failed {
            reason, verdicts, ..
        } => println!(
            "{:?}: failed ({:?}) after {} verdict(s)",
            client.local(),
            reason,
            verdicts.len()
        ),
    }
    for verdict in outcome.verdicts() {
        println!(
            "    epoch {} {} at {}: {:?}",
            verdict.epoch, verdict.reason, verdict.phase, verdict.blamed
        );
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
