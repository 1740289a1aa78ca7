//! Runs one experiment config. Display events are written to stdout, one
//! RON document per line, and control signals are read from stdin, one per
//! line (`start`, `sweep-counter`, `connect <id>`, `disconnect <id>`).

use clap::Parser;
use flyflix::{
    args::FlyflixArgs,
    config::ExperimentConfig,
    context::ExperimentContext,
    control_flags::{ControlFlags, ControlSignal},
    error::FlyflixError,
    event::RonSink,
    heartbeat::Heartbeat,
    runner::{RunSettings, Runner},
};

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    fs::OpenOptions,
    io::{self, BufRead},
    process,
    sync::Arc,
    thread,
    time::Duration,
};

// Example:
// cargo run --bin flyflix -- --config configs/cshlfly22.ron --data fly01.ron

fn main() {
    env_logger::init();
    let args = FlyflixArgs::parse();

    if let Err(e) = run(&args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(args: &FlyflixArgs) -> Result<(), FlyflixError> {
    let mut config = ExperimentConfig::from_path(&args.config)?;
    args.apply(&mut config);
    info!("Loaded {}", args.config.display());

    let data_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.data)?;
    let events = Arc::new(RonSink::new(io::stdout()));
    let data = Arc::new(RonSink::new(data_file));
    let ctx = ExperimentContext::new(events.clone(), data).with_poll_interval(config.poll_interval());

    spawn_signal_reader(ctx.flags.clone());

    let mut heartbeat = config
        .heartbeat_ms
        .map(|ms| Heartbeat::spawn(events, Duration::from_millis(ms)));

    let block = config.block.generate();
    info!(
        "{} conditions, {} repetitions",
        block.len(),
        config.repetitions
    );

    let mut runner = Runner::new(
        ctx,
        RunSettings::from(&config),
        StdRng::from_entropy(),
    );
    let executions = runner.run(&block, config.repetitions)?;
    info!("Finished {} trials", executions.len());

    if let Some(heartbeat) = heartbeat.as_mut() {
        debug!("Sent {} pings", heartbeat.stop());
    }
    Ok(())
}

fn spawn_signal_reader(flags: Arc<ControlFlags>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Stopped reading control signals: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ControlSignal>() {
                Ok(signal) => flags.apply(&signal),
                Err(e) => warn!("{}", e),
            }
        }
        debug!("Control signal input closed");
    });
}
