use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::info;
use updraft_simulator::{Api, Simulator};
use updraft_types::Multiplier;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Optional YAML pacing config; defaults pace a round every ~15s.
    #[arg(short, long)]
    config: Option<String>,
}

/// Round pacing knobs for the driving loop.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Pacing {
    /// Length of the betting window, in seconds.
    waiting_secs: u64,
    /// Milliseconds between multiplier ticks.
    tick_interval_ms: u64,
    /// Multiplier growth per tick, in basis points (300 = 3% per tick).
    growth_per_tick_bps: u64,
    /// Seconds counted down after a crash before the next window.
    countdown_secs: u32,
    /// Cap on house-curve crash points, in basis points.
    max_crash_bps: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            waiting_secs: 5,
            tick_interval_ms: 100,
            growth_per_tick_bps: 300,
            countdown_secs: 3,
            max_crash_bps: 160_000,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let pacing = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {path}"))?;
            serde_yaml::from_str(&raw).context("invalid pacing config")?
        }
        None => Pacing::default(),
    };

    let simulator = Arc::new(Simulator::new());
    let api = Api::new(simulator.clone());
    let app = api.router();

    tokio::spawn(run_rounds(simulator, pacing));

    // Start server
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}

/// Drive rounds forever: betting window, launch, tick to the crash point,
/// crash, countdown, repeat. The crash point comes from the operator
/// override schedule when armed, otherwise from the house curve.
async fn run_rounds(simulator: Arc<Simulator>, pacing: Pacing) {
    loop {
        let round = simulator.begin_waiting();
        info!(%round, "betting window open");
        sleep(Duration::from_secs(pacing.waiting_secs)).await;

        let crash_at = simulator
            .take_crash_point()
            .unwrap_or_else(|| house_crash_point(pacing.max_crash_bps));
        info!(%round, %crash_at, "round launched");
        simulator.start_round();

        let mut multiplier = Multiplier::ONE;
        loop {
            sleep(Duration::from_millis(pacing.tick_interval_ms)).await;
            let grown =
                multiplier.bps() + multiplier.bps() * pacing.growth_per_tick_bps / Multiplier::BASE;
            multiplier = Multiplier::from_bps(grown.max(multiplier.bps() + 1));
            if multiplier >= crash_at {
                break;
            }
            simulator.tick(multiplier);
        }
        simulator.crash(crash_at);
        info!(%round, %crash_at, "round crashed");

        for seconds_left in (1..=pacing.countdown_secs).rev() {
            simulator.countdown(seconds_left);
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Sample a crash point from an inverse-uniform house curve: half of all
/// rounds crash below 2.00x, with a long tail capped at `max_bps`.
fn house_crash_point(max_bps: u64) -> Multiplier {
    let u: f64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..1.0);
    let multiplier = 1.0 / (1.0 - u * 0.99);
    let bps = (multiplier * Multiplier::BASE as f64) as u64;
    Multiplier::from_bps(bps.clamp(Multiplier::BASE, max_bps))
}
