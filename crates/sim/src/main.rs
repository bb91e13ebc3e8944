mod session;

use anyhow::Result;
use clap::Parser;

use protosync::{LinkConditions, ReplicationConfig};
use session::{Session, SessionConfig};

#[derive(Parser)]
#[command(name = "protosync-sim")]
#[command(about = "Runs a server and a predicting client over a simulated link")]
struct Args {
    #[arg(short, long, default_value_t = 1800)]
    ticks: u32,

    #[arg(long, default_value_t = 240, help = "Ticks to keep running after inputs stop")]
    settle_ticks: u32,

    #[arg(short = 'r', long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 4, help = "Server-driven units besides the player")]
    entities: usize,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Duplication percentage (0-100)")]
    duplicate_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum delay in ticks")]
    min_delay: u32,

    #[arg(long, default_value_t = 0, help = "Maximum delay in ticks")]
    max_delay: u32,

    #[arg(short, long, default_value_t = 1)]
    seed: u64,

    #[arg(long, default_value_t = 60)]
    keyframe_interval: u32,

    #[arg(long, help = "Exit with an error if the client did not converge")]
    strict: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let impaired = args.loss_percent > 0.0 || args.duplicate_percent > 0.0 || args.max_delay > 0;
    let link = LinkConditions {
        enabled: impaired,
        loss_percent: args.loss_percent,
        duplicate_percent: args.duplicate_percent,
        min_delay_ticks: args.min_delay.min(args.max_delay),
        max_delay_ticks: args.max_delay,
    };

    let replication = ReplicationConfig {
        tick_rate: args.tick_rate,
        keyframe_interval_ticks: args.keyframe_interval,
        ..Default::default()
    };

    let config = SessionConfig {
        replication,
        link,
        units: args.entities,
        seed: args.seed,
        ..Default::default()
    };

    let mut session = Session::new(config)?;
    log::info!("running {} ticks at {} Hz", args.ticks, args.tick_rate);

    for _ in 0..args.ticks {
        session.step()?;
    }
    session.stop_inputs();
    for _ in 0..args.settle_ticks {
        session.step()?;
    }

    let report = session.report();
    log::info!(
        "{} ticks: {} inputs issued, {} refused while resyncing",
        report.ticks,
        report.inputs_issued,
        report.inputs_refused
    );
    log::info!(
        "downstream: {} sent, {} dropped ({:.1}%), {} duplicated, {} bytes",
        report.downstream.messages_sent,
        report.downstream.messages_dropped,
        report.downstream.loss_percent(),
        report.downstream.messages_duplicated,
        report.downstream.bytes_sent
    );
    log::info!(
        "upstream: {} sent, {} dropped ({:.1}%), {} duplicated, {} bytes",
        report.upstream.messages_sent,
        report.upstream.messages_dropped,
        report.upstream.loss_percent(),
        report.upstream.messages_duplicated,
        report.upstream.bytes_sent
    );
    log::info!("server: {:?}", report.server_stats);
    log::info!("client: {:?}", report.client_stats);
    log::info!(
        "entities: server {}, client {}; player error {:.4}; {} units out of sync",
        report.server_entities,
        report.client_entities,
        report.player_error,
        report.mismatched_units
    );

    let converged = report.converged(0.01);
    if converged {
        log::info!("client converged on the authoritative state");
    } else {
        log::warn!("client did not converge");
    }
    if args.strict {
        anyhow::ensure!(converged, "client did not converge after {} ticks", report.ticks);
    }

    Ok(())
}
