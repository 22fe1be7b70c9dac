use std::{
    path::PathBuf,
    process,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{
    error::ErrorKind,
    Parser,
};
use libp2p::Multiaddr;
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flowrunner::{
    config::Config,
    db::{PgStore, StoreAddress},
    ingest::Ingestor,
    invoke::Invoker,
    supervisor::{JobRunner, Supervisor},
    transport::{self, Overlay},
    writer::Writer,
};

// CLI
#[derive(Parser, Debug)]
#[command(name = "flowrunner")]
#[command(version = "1.0")]
#[command(about = "Accepts record batches over a p2p overlay, runs them through \
                   a transform flow and persists the results to PostgreSQL.",
          long_about = None)
]
struct Cli {
    /// The node's identity, a protobuf-encoded libp2p keypair
    identity: PathBuf,

    /// Service name to bind on the overlay, e.g. `transform`
    service: String,

    /// `host[:port]` or `p2p://<peer-id>/<service>`
    store: String,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `overlay.listen` of the config
    #[arg(short, long)]
    listen: Vec<Multiaddr>,

    #[arg(short, long)]
    bootnode: Vec<Multiaddr>,

    /// Create the identity if it does not exist yet
    #[arg(long, action)]
    generate_identity: bool,
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,

        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),

            // usage goes to stdout, same as --help
            _ => {
                print!("{}", e.render());
                process::exit(1);
            },
        },
    }
}

fn parse_addrs(addrs: &[String]) -> anyhow::Result<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .with_context(|| format!("invalid multiaddr `{addr}`"))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .try_init();

    let cli = parse_cli();
    info!("<-> flowrunner: overlay transform service <->");

    let config = Config::load(cli.config.as_deref())?;
    let store_address: StoreAddress = cli.store
        .parse()
        .with_context(|| format!("invalid store address `{}`", cli.store))?;

    // local libp2p key
    let local_key = transport::load_identity(&cli.identity, cli.generate_identity)?;

    let listen = if cli.listen.is_empty() {
        parse_addrs(&config.overlay.listen)?
    } else {
        cli.listen
    };
    let mut bootnodes = parse_addrs(&config.overlay.bootnodes)?;
    bootnodes.extend(cli.bootnode);

    // the overlay outlives the supervisor so draining jobs can still reach the store
    let overlay_shutdown = CancellationToken::new();
    let overlay = Overlay::start(
        local_key,
        &listen,
        &bootnodes,
        overlay_shutdown.clone(),
    )?;
    info!("Peer id: `{}`", overlay.peer_id());
    let listener = overlay.bind(&cli.service, config.overlay.backlog)?;

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, finishing jobs in flight...");
                interrupt.cancel();
            },

            Err(e) => warn!("Failed to listen for ctrl-c: `{e}`"),
        }
    });

    //@ routes take a while to propagate after bind
    let settle = Duration::from_secs(config.overlay.settle_secs);
    info!("Waiting `{settle:?}` for the overlay to settle...");
    tokio::select! {
        _ = shutdown.cancelled() => {},

        _ = tokio::time::sleep(settle) => {},
    }
    info!(
        "Actively listening on `{}` as `{}`, store: `{store_address}`",
        listener.protocol().as_ref(),
        overlay.peer_id()
    );

    let store = PgStore::new(store_address, &config.store, Some(overlay.control()))?;
    let runner = JobRunner::new(
        Ingestor::new(&config.ingest),
        Invoker::new(
            &config.transform,
            &overlay.peer_id().to_string(),
            listener.protocol().as_ref(),
        ),
        Writer::new(Arc::new(store), config.store.connection_scope),
    );
    let supervisor = Supervisor::new(listener, runner, &config.supervisor);
    let stats = supervisor.run(shutdown).await;
    overlay_shutdown.cancel();
    info!(
        "Bye: `{}` jobs completed, `{}` skipped, `{}` failed, `{}` rows inserted, `{}` rows failed.",
        stats.jobs_completed,
        stats.jobs_skipped,
        stats.jobs_failed,
        stats.rows_inserted,
        stats.rows_failed
    );
    Ok(())
}
