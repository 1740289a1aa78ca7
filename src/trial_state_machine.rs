//! Runs a single scheduled [Trial] through its phases.
//!
//! ```text
//! PreTrial -> Stimulus -> PostTrial -> ClosedLoop -> Done
//!                                  \________________/
//!                                   (no closed loop)
//! ```
//!
//! Timed phases compute their deadline once at entry and wait on it in
//! steps of the context's poll interval. A sweep stimulus has no deadline
//! and waits for the client's sweep-counter signal instead.

use crate::{
    context::ExperimentContext,
    event::{LogRecord, Payload, Value},
    trial::{Motion, StimulusMode, Trial},
};

use log::info;
use std::time::{Duration, Instant};

/// A trial phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Screen off, pattern prepared.
    PreTrial,
    /// Pattern moves open-loop or sweeps.
    Stimulus,
    /// Pattern visible and static.
    PostTrial,
    /// Pattern driven by the fly's heading.
    ClosedLoop,
    /// Terminal.
    Done,
}

impl Phase {
    /// The key of the `meta` event emitted when this phase is entered.
    pub fn key(&self) -> &'static str {
        match self {
            Phase::PreTrial => "pretrial-start",
            Phase::Stimulus => "stimulus-start",
            Phase::PostTrial => "posttrial-start",
            Phase::ClosedLoop => "closedloop-start",
            Phase::Done => "done",
        }
    }

    /// The phase after this one for the given trial, `None` after
    /// [Phase::Done].
    pub fn next(&self, trial: &Trial) -> Option<Phase> {
        use Phase::*;
        Some(match self {
            PreTrial => Stimulus,
            Stimulus => PostTrial,
            PostTrial if trial.has_closed_loop() => ClosedLoop,
            PostTrial | ClosedLoop => Done,
            Done => return None,
        })
    }
}

/// What happened while a trial ran.
#[derive(Debug, Clone)]
pub struct TrialExecution {
    /// The trial, including its id
    pub trial: Trial,
    /// Every phase entered, with the monotonic time of entry
    pub transitions: Vec<(Phase, Instant)>,
}

impl TrialExecution {
    /// Phases in the order they were entered.
    pub fn phases(&self) -> Vec<Phase> {
        self.transitions.iter().map(|(phase, _)| *phase).collect()
    }

    /// Time between entering `from` and entering `to`.
    pub fn between(&self, from: Phase, to: Phase) -> Option<Duration> {
        let at = |p: Phase| self.transitions.iter().find(|(q, _)| *q == p).map(|(_, t)| *t);
        Some(at(to)?.duration_since(at(from)?))
    }
}

/// Hold until `deadline`, sleeping at most `step` at a time.
pub fn wait_until(deadline: Instant, step: Duration) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        spin_sleep::sleep(step.min(deadline - now));
    }
}

/// Drives one trial. Construct it, call [TrialStateMachine::run] once.
pub struct TrialStateMachine<'a> {
    trial: Trial,
    id: u64,
    ctx: &'a ExperimentContext,
    transitions: Vec<(Phase, Instant)>,
}

impl<'a> TrialStateMachine<'a> {
    /// Prepare a trial for execution.
    ///
    /// # Panics
    /// If the trial has not been scheduled (has no id).
    pub fn new(trial: Trial, ctx: &'a ExperimentContext) -> Self {
        let id = trial
            .id()
            .unwrap_or_else(|| panic!("{} executed without an id", trial));
        Self {
            trial,
            id,
            ctx,
            transitions: Vec::with_capacity(5),
        }
    }

    /// Run every phase to completion. Consumes the machine, so a trial can
    /// only ever be executed once.
    pub fn run(mut self) -> TrialExecution {
        info!("Running {}", self.trial);
        let mut phase = Phase::PreTrial;
        loop {
            self.enter(phase);
            match phase.next(&self.trial) {
                Some(next) => phase = next,
                None => break,
            }
        }
        TrialExecution {
            trial: self.trial,
            transitions: self.transitions,
        }
    }

    fn enter(&mut self, phase: Phase) {
        info!("Trial {} entering {:?}", self.id, phase);
        self.transitions.push((phase, Instant::now()));
        self.ctx.emit(Payload::meta(phase.key(), self.id));

        match phase {
            Phase::PreTrial => self.pretrial(),
            Phase::Stimulus => self.stimulus(),
            Phase::PostTrial => self.posttrial(),
            Phase::ClosedLoop => self.closed_loop(),
            Phase::Done => self.record("trial-end", self.id),
        }
    }

    fn record(&self, key: &str, value: impl Into<Value>) {
        self.ctx.record(LogRecord::server(key, value));
    }

    fn hold(&self, duration: Duration) {
        wait_until(Instant::now() + duration, self.ctx.poll_interval);
    }

    fn pretrial(&self) {
        let trial = &self.trial;
        let deadline = Instant::now() + trial.pretrial;

        self.record("trial-id", self.id);
        self.record("condition", trial.comment.as_str());
        self.record("pre-trial-duration", trial.pretrial.as_millis() as u64);
        self.record("fg-color", trial.foreground_hex());
        match trial.bar_height {
            Some(height) => self.record("bar-height", height),
            None => self.record("bar-height", Value::Empty),
        }

        self.ctx.emit(Payload::Speed {
            reference_id: self.id,
            velocity: 0.0,
        });
        self.ctx.emit(Payload::Screen {
            on: false,
            background: Some(trial.background_hex()),
        });
        self.ctx.emit(Payload::Foreground(trial.foreground_hex()));
        self.ctx.emit(Payload::BarHeight(trial.bar_height));
        self.ctx.emit(Payload::SpatFreq(trial.spatial_frequency()));

        wait_until(deadline, self.ctx.poll_interval);
    }

    fn stimulus(&self) {
        let trial = &self.trial;

        self.ctx.emit(Payload::Screen {
            on: true,
            background: Some(trial.background_hex()),
        });
        self.record("move-speed", trial.motion.velocity());
        self.ctx.emit(Payload::Speed {
            reference_id: self.id,
            velocity: trial.motion.velocity(),
        });
        if let Motion::Oscillation { freq_hz, width_deg } = trial.motion {
            self.ctx.emit(Payload::Oscillation {
                reference_id: self.id,
                frequency: freq_hz,
                width: width_deg,
            });
        }
        self.record("show-only-nth-frame", trial.nth_frame);
        self.ctx.emit(Payload::NthFrame(trial.nth_frame));

        match trial.mode {
            StimulusMode::OpenLoop(duration) => {
                self.record("open-loop-duration", duration.as_millis() as u64);
                self.hold(duration);
            }
            StimulusMode::Sweep(count) => {
                self.ctx.flags.reset_sweep_reached();
                self.record("send-sweep-reset", count);
                self.ctx.emit(Payload::SweepCount(count));
                self.ctx.flags.wait_sweep_reached(self.ctx.poll_interval);
                self.record("sweep-reached", count);
            }
        }
    }

    fn posttrial(&self) {
        let trial = &self.trial;
        let deadline = Instant::now() + trial.posttrial;

        self.record("post-trial-duration", trial.posttrial.as_millis() as u64);
        self.ctx.emit(Payload::Speed {
            reference_id: self.id,
            velocity: 0.0,
        });
        self.ctx.emit(Payload::Screen {
            on: true,
            background: Some(trial.background_hex()),
        });

        wait_until(deadline, self.ctx.poll_interval);
        self.record("post-trial-end", Value::Empty);
    }

    fn closed_loop(&self) {
        let trial = &self.trial;
        let closed_loop = &trial.closed_loop;
        let deadline = Instant::now() + closed_loop.duration;

        self.ctx
            .emit(Payload::SpatFreq(trial.closed_loop_spatial_frequency()));
        if let Some(start) = closed_loop.start_position_deg {
            self.ctx.emit(Payload::RotateTo {
                reference_id: self.id,
                angle: start.to_radians(),
            });
        }

        self.record("closed-loop-start", closed_loop.gain);
        self.ctx.gain.engage(closed_loop.gain);
        wait_until(deadline, self.ctx.poll_interval);
        self.ctx.gain.disengage();
        self.record("closed-loop-end", closed_loop.duration.as_millis() as u64);

        self.ctx.emit(Payload::Speed {
            reference_id: self.id,
            velocity: 0.0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::ClosedLoop;
    use std::thread;

    fn quick_trial(id: u64) -> Trial {
        let mut trial = Trial::builder()
            .rotate_deg_hz(30.0)
            .pretrial(Duration::ZERO)
            .stimulus_duration(Duration::ZERO)
            .posttrial(Duration::ZERO)
            .comment("quick")
            .build();
        trial.set_id(id);
        trial
    }

    #[test]
    fn phase_sequence_without_closed_loop() {
        let (ctx, sink) = ExperimentContext::in_memory();
        let mut trial = Trial::builder()
            .pretrial(Duration::from_millis(250))
            .stimulus_duration(Duration::from_millis(1000))
            .posttrial(Duration::from_millis(250))
            .build();
        trial.set_id(1);

        let execution = TrialStateMachine::new(trial, &ctx).run();

        assert_eq!(
            sink.meta_keys(),
            vec!["pretrial-start", "stimulus-start", "posttrial-start", "done"]
        );
        assert_eq!(
            execution.phases(),
            vec![Phase::PreTrial, Phase::Stimulus, Phase::PostTrial, Phase::Done]
        );
        assert!(execution.between(Phase::PreTrial, Phase::Stimulus).unwrap() >= Duration::from_millis(250));
        assert!(execution.between(Phase::Stimulus, Phase::PostTrial).unwrap() >= Duration::from_millis(1000));
        assert!(!ctx.gain.snapshot().enabled);
    }

    #[test]
    fn phase_events_carry_the_trial_id() {
        let (ctx, sink) = ExperimentContext::in_memory();
        TrialStateMachine::new(quick_trial(17), &ctx).run();

        for event in sink.events() {
            if let Payload::Meta { value, .. } = event.payload {
                assert_eq!(value, Value::Int(17));
            }
        }
    }

    #[test]
    fn closed_loop_engages_and_releases_the_controller() {
        let (ctx, sink) = ExperimentContext::in_memory();
        let mut trial = quick_trial(3).unscheduled();
        trial.closed_loop = ClosedLoop {
            duration: Duration::from_millis(200),
            gain: 4.0,
            start_position_deg: Some(90.0),
            ..ClosedLoop::default()
        };
        trial.set_id(3);

        let observer = {
            let gain = ctx.gain.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                while Instant::now() < deadline {
                    let state = gain.snapshot();
                    if state.enabled {
                        return Some(state.gain);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                None
            })
        };

        let execution = TrialStateMachine::new(trial, &ctx).run();

        assert_eq!(observer.join().unwrap(), Some(4.0));
        assert!(!ctx.gain.snapshot().enabled);
        assert_eq!(
            execution.phases(),
            vec![
                Phase::PreTrial,
                Phase::Stimulus,
                Phase::PostTrial,
                Phase::ClosedLoop,
                Phase::Done
            ]
        );
        assert!(execution.between(Phase::ClosedLoop, Phase::Done).unwrap() >= Duration::from_millis(200));
        assert!(sink.events().iter().any(|e| e.payload
            == Payload::RotateTo {
                reference_id: 3,
                angle: 90f64.to_radians()
            }));
        assert!(sink
            .records()
            .iter()
            .any(|r| r.key == "closed-loop-start" && r.value == Value::Float(4.0)));
    }

    #[test]
    fn sweep_waits_for_the_client() {
        let (ctx, sink) = ExperimentContext::in_memory();
        let ctx = ctx.with_poll_interval(Duration::from_millis(5));
        let mut trial = quick_trial(5).unscheduled();
        trial.mode = StimulusMode::Sweep(2);
        trial.set_id(5);

        // A signal left over from an earlier sweep must not end this one.
        ctx.flags.signal_sweep_reached();

        thread::scope(|s| {
            let runner = s.spawn(|| TrialStateMachine::new(trial, &ctx).run());

            thread::sleep(Duration::from_millis(150));
            assert!(!runner.is_finished());
            assert!(!sink.meta_keys().contains(&"posttrial-start".to_owned()));
            assert!(sink.events().iter().any(|e| e.payload == Payload::SweepCount(2)));

            let signalled = Instant::now();
            ctx.flags.signal_sweep_reached();
            let execution = runner.join().unwrap();

            let posttrial = execution
                .transitions
                .iter()
                .find(|(p, _)| *p == Phase::PostTrial)
                .map(|(_, t)| *t)
                .unwrap();
            assert!(posttrial.saturating_duration_since(signalled) < Duration::from_millis(100));
        });

        assert_eq!(sink.meta_keys().last().map(String::as_str), Some("done"));
    }

    #[test]
    fn oscillation_sends_pattern_command() {
        let (ctx, sink) = ExperimentContext::in_memory();
        let mut trial = quick_trial(8).unscheduled();
        trial.motion = Motion::Oscillation {
            freq_hz: 0.333,
            width_deg: 90.0,
        };
        trial.set_id(8);

        TrialStateMachine::new(trial, &ctx).run();

        assert!(sink.events().iter().any(|e| e.payload
            == Payload::Oscillation {
                reference_id: 8,
                frequency: 0.333,
                width: 90.0
            }));
    }

    #[test]
    fn pattern_colour_and_height_reach_the_display() {
        let (ctx, sink) = ExperimentContext::in_memory();
        let mut trial = quick_trial(9).unscheduled();
        trial.fg_color = 0x00_BE_00;
        trial.bg_color = 0x00_40_00;
        trial.bar_height = Some(0.03);
        trial.set_id(9);

        TrialStateMachine::new(trial, &ctx).run();

        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| e.payload == Payload::Foreground("#00BE00".to_owned())));
        assert!(events
            .iter()
            .any(|e| e.payload == Payload::BarHeight(Some(0.03))));

        let records = sink.records();
        assert!(records
            .iter()
            .any(|r| r.key == "fg-color" && r.value == Value::Text("#00BE00".to_owned())));
        assert!(records
            .iter()
            .any(|r| r.key == "bar-height" && r.value == Value::Float(0.03)));
    }

    #[test]
    #[should_panic(expected = "without an id")]
    fn unscheduled_trial_cannot_run() {
        let (ctx, _sink) = ExperimentContext::in_memory();
        TrialStateMachine::new(Trial::builder().build(), &ctx);
    }

    #[test]
    fn wait_until_respects_the_deadline() {
        let start = Instant::now();
        wait_until(start + Duration::from_millis(30), Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
