//! Drives whole blocks: waits for the start signal, keeps the telemetry
//! listener alive for the duration of the run, and executes shuffled
//! repetitions of a block one trial at a time.

use crate::{
    block::Block,
    config::{ExperimentConfig, TelemetryConfig},
    context::ExperimentContext,
    error::FlyflixError,
    event::{LogRecord, Payload},
    telemetry_listener::TelemetryListener,
    trial_state_machine::{wait_until, TrialExecution, TrialStateMachine},
};

use log::{info, warn};
use rand::{seq::SliceRandom, Rng};
use std::time::{Duration, Instant};

/// Run-level settings that are not part of any single trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSettings {
    /// Blank screen time before the first repetition
    pub opening_delay: Duration,
    /// Where to listen for the sensor, `None` to run open loop only
    pub telemetry: Option<TelemetryConfig>,
    /// Key/value pairs written to the data log once at start
    pub metadata: Vec<(String, String)>,
}

impl From<&ExperimentConfig> for RunSettings {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            opening_delay: Duration::from_millis(config.opening_delay_ms),
            telemetry: config.telemetry.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

/// Sequences trials. The id counter lives as long as the runner, so ids
/// stay unique across repeated calls.
pub struct Runner<R: Rng> {
    ctx: ExperimentContext,
    settings: RunSettings,
    rng: R,
    next_id: u64,
}

impl<R: Rng> Runner<R> {
    /// Make a runner. `rng` decides every shuffle.
    pub fn new(ctx: ExperimentContext, settings: RunSettings, rng: R) -> Self {
        Self {
            ctx,
            settings,
            rng,
            next_id: 0,
        }
    }

    /// The id the next scheduled trial will get.
    pub fn next_id(&self) -> u64 {
        self.next_id + 1
    }

    /// The full experiment: block until started, bring up telemetry, run
    /// the block and shut telemetry down again.
    pub fn run(
        &mut self,
        block: &Block,
        repetitions: u32,
    ) -> Result<Vec<TrialExecution>, FlyflixError> {
        info!("Waiting for the start signal");
        self.ctx.flags.wait_started();
        info!("Experiment started");

        let mut listener = match &self.settings.telemetry {
            Some(config) => Some(TelemetryListener::spawn(config, self.ctx.clone())?),
            None => {
                warn!("Telemetry disabled, closed-loop phases will get no feedback");
                None
            }
        };

        for (key, value) in &self.settings.metadata {
            self.ctx.record(LogRecord::server(key.as_str(), value.as_str()));
        }

        let executions = self.run_block(block, repetitions);

        if let Some(listener) = listener.as_mut() {
            let exit = listener.stop()?;
            info!("Telemetry listener exited: {:?}", exit);
        }
        Ok(executions)
    }

    /// Play the opening blank, then `repetitions` shuffled passes over
    /// `block`, each trial run to completion before the next one starts.
    pub fn run_block(&mut self, block: &Block, repetitions: u32) -> Vec<TrialExecution> {
        let total = block.len() * repetitions as usize;
        let mut executions = Vec::with_capacity(total);

        self.ctx.emit(Payload::Screen {
            on: false,
            background: None,
        });
        wait_until(
            Instant::now() + self.settings.opening_delay,
            self.ctx.poll_interval,
        );

        for repetition in 0..repetitions {
            self.ctx.emit(Payload::meta("block-repetition", repetition));
            info!("Repetition {} of {}", repetition + 1, repetitions);

            let mut order: Vec<_> = block.iter().map(|t| t.unscheduled()).collect();
            order.shuffle(&mut self.rng);

            for mut trial in order {
                self.next_id += 1;
                trial.set_id(self.next_id);
                info!(
                    "Condition {} of {}: {}",
                    executions.len() + 1,
                    total,
                    trial
                );
                executions.push(TrialStateMachine::new(trial, &self.ctx).run());
            }
        }
        executions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::Trial;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashMap;

    fn block(n: usize) -> Block {
        (0..n)
            .map(|i| {
                Trial::builder()
                    .pretrial(Duration::ZERO)
                    .stimulus_duration(Duration::ZERO)
                    .posttrial(Duration::ZERO)
                    .comment(format!("condition {}", i))
                    .build()
            })
            .collect()
    }

    fn runner() -> (Runner<StdRng>, std::sync::Arc<crate::event::MemorySink>) {
        let (ctx, sink) = ExperimentContext::in_memory();
        let ctx = ctx.with_poll_interval(Duration::from_millis(1));
        (
            Runner::new(ctx, RunSettings::default(), StdRng::seed_from_u64(7)),
            sink,
        )
    }

    fn comments(executions: &[TrialExecution]) -> Vec<String> {
        executions.iter().map(|e| e.trial.comment.clone()).collect()
    }

    #[test]
    fn ids_are_sequential_across_repetitions() {
        let (mut runner, _sink) = runner();
        let executions = runner.run_block(&block(5), 3);

        let ids: Vec<u64> = executions.iter().filter_map(|e| e.trial.id()).collect();
        assert_eq!(ids, (1..=15).collect::<Vec<_>>());
    }

    #[test]
    fn each_repetition_is_a_permutation() {
        let (mut runner, _sink) = runner();
        let block = block(6);
        let executions = runner.run_block(&block, 4);

        let mut expected: Vec<String> = block.iter().map(|t| t.comment.clone()).collect();
        expected.sort();
        for rep in executions.chunks(block.len()) {
            let mut seen = comments(rep);
            seen.sort();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn shuffles_are_roughly_uniform() {
        let (mut runner, _sink) = runner();
        let block = block(3);
        let executions = runner.run_block(&block, 600);

        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        for rep in executions.chunks(3) {
            *counts.entry(comments(rep)).or_default() += 1;
        }
        assert_eq!(counts.len(), 6);
        assert!(counts.values().all(|&n| n > 60));
    }

    #[test]
    fn counter_survives_between_blocks() {
        let (mut runner, _sink) = runner();
        runner.run_block(&block(2), 1);
        assert_eq!(runner.next_id(), 3);

        let executions = runner.run_block(&block(2), 2);
        let ids: Vec<u64> = executions.iter().filter_map(|e| e.trial.id()).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }

    #[test]
    fn repetitions_are_announced() {
        let (mut runner, sink) = runner();
        runner.run_block(&block(1), 2);

        let keys = sink.meta_keys();
        assert_eq!(
            keys.iter().filter(|k| *k == "block-repetition").count(),
            2
        );
        assert_eq!(sink.events()[0].name(), "screen");
    }

    #[test]
    fn run_logs_metadata_once_started() {
        let (ctx, sink) = ExperimentContext::in_memory();
        ctx.flags.set_started();
        let settings = RunSettings {
            metadata: vec![("fly".to_owned(), "CS 3d".to_owned())],
            ..RunSettings::default()
        };
        let mut runner = Runner::new(
            ctx.with_poll_interval(Duration::from_millis(1)),
            settings,
            StdRng::seed_from_u64(1),
        );

        let executions = runner.run(&block(2), 1).unwrap();
        assert_eq!(executions.len(), 2);
        let records = sink.records();
        assert!(records
            .iter()
            .any(|r| r.key == "fly" && r.value.to_string() == "CS 3d"));
    }
}
