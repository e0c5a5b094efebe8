//! Huddle Call Demo - Loopback call between two local identities
//!
//! Runs a complete call over the in-memory signaling store and the loopback
//! transport, then prints the resulting call record.
//!
//! # Usage
//!
//! ```bash
//! # Alice calls Bob, holds for one second, hangs up
//! huddle-call-demo
//!
//! # Share the screen mid-call and watch negotiation logs
//! huddle-call-demo --caller ana --callee ben --screen-share -vv
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use huddle_call::media::StaticMediaDevices;
use huddle_call::peer::{LoopbackNetwork, LoopbackTransportFactory};
use huddle_call::signaling::{MemoryDocumentStore, CALLS_COLLECTION};
use huddle_call::{
    CallConfig, CallSessionController, CallSnapshot, NegotiationState, SignalingChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Huddle Call Demo - run a loopback call
#[derive(Parser)]
#[command(name = "huddle-call-demo")]
#[command(author, version)]
#[command(about = "Run a caller/callee call over in-memory signaling")]
struct Args {
    /// Caller identity
    #[arg(long, env = "HUDDLE_CALLER", default_value = "alice")]
    caller: String,

    /// Callee identity
    #[arg(long, env = "HUDDLE_CALLEE", default_value = "bob")]
    callee: String,

    /// How long to stay connected before hanging up (milliseconds)
    #[arg(long, default_value_t = 1000)]
    hold_ms: u64,

    /// Signaling write timeout (milliseconds)
    #[arg(long, env = "HUDDLE_PERSISTENCE_TIMEOUT_MS", default_value_t = 5000)]
    persistence_timeout_ms: u64,

    /// Share the caller's screen while connected
    #[arg(long)]
    screen_share: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(args: &Args) {
    let default = match args.verbose {
        0 => "info,huddle_call=debug",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());

    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

async fn wait_for(
    controller: &CallSessionController,
    what: &str,
    check: impl FnMut(&CallSnapshot) -> bool,
) -> Result<CallSnapshot> {
    let mut rx = controller.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(check))
        .await
        .with_context(|| format!("{} timed out waiting for {}", controller.local_id(), what))?
        .context("controller dropped")?;
    Ok(snapshot.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    if args.caller == args.callee {
        bail!("caller and callee must differ");
    }

    let config = CallConfig {
        persistence_timeout_ms: args.persistence_timeout_ms,
        ..Default::default()
    };
    let store = Arc::new(MemoryDocumentStore::new());
    let network = LoopbackNetwork::new();

    let participant = |id: &str| {
        CallSessionController::new(
            id,
            config.clone(),
            SignalingChannel::new(store.clone()),
            Arc::new(StaticMediaDevices::new()),
            Arc::new(LoopbackTransportFactory::new(network.clone())),
        )
    };
    let caller = participant(&args.caller)?;
    let callee = participant(&args.callee)?;
    callee.start_watching().await?;

    info!("huddle-call {} demo starting", huddle_call::version());
    let call_id = caller.start_call(&args.callee).await?;

    let ringing = wait_for(&callee, "incoming call", |s| s.incoming.is_some()).await?;
    if let Some(incoming) = &ringing.incoming {
        info!("{} sees a call from {}", args.callee, incoming.caller_id);
    }
    callee.answer_call().await?;

    let connected = |s: &CallSnapshot| s.phase == NegotiationState::Connected;
    wait_for(&caller, "connection", connected).await?;
    wait_for(&callee, "connection", connected).await?;
    info!("Call {} connected", call_id);

    if args.screen_share {
        caller.share_screen().await?;
        wait_for(&caller, "screen share", |s| s.screen_sharing).await?;
        info!("{} is sharing their screen", args.caller);
    }

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;
    caller.end_call().await;

    let ended = wait_for(&callee, "hang-up", |s| s.phase == NegotiationState::Ended).await?;
    info!("Call ended ({:?})", ended.ended_reason);

    let record = store
        .document(CALLS_COLLECTION, &call_id)
        .with_context(|| format!("call record {} missing", call_id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
