//! The closed-loop feedback controller.
//!
//! Every decoded [Frame] goes through [GainController::on_frame]. While the
//! loop is engaged the change in heading since the previous frame is scaled
//! by the gain and inverted, and the result is sent to the display as the new
//! stimulus velocity. While disengaged the controller only remembers the
//! heading, so that engaging never produces a jump from a stale delta.

use crate::telemetry_message_decoder::Frame;

use std::sync::{Arc, Mutex, MutexGuard};

/// The state shared between the telemetry listener and the trial runner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GainState {
    /// Whether frames produce velocity commands
    pub enabled: bool,
    /// Multiplier from heading delta to stimulus velocity
    pub gain: f64,
    /// Heading of the most recent frame, `None` before the first frame
    pub previous_heading: Option<f64>,
}

/// A velocity command derived from one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityCommand {
    /// Frame count of the frame that produced the command
    pub reference_id: u64,
    /// New stimulus velocity
    pub velocity: f64,
}

impl GainState {
    /// Feed one frame through the controller.
    ///
    /// `previous_heading` is updated whether or not the loop is enabled.
    /// No command is produced for the very first frame since there is
    /// nothing to take a delta against.
    pub fn apply(&mut self, frame: &Frame) -> Option<VelocityCommand> {
        let previous = self.previous_heading.replace(frame.heading);

        if !self.enabled {
            return None;
        }

        previous.map(|previous| VelocityCommand {
            reference_id: frame.frame_count,
            velocity: (frame.heading - previous) * self.gain * -1.0,
        })
    }
}

/// A cloneable, thread-safe handle to a single [GainState].
///
/// All reads and writes happen under one lock, so a frame never observes
/// `enabled` and `gain` from two different updates.
#[derive(Debug, Clone, Default)]
pub struct GainController {
    state: Arc<Mutex<GainState>>,
}

impl GainController {
    /// A disengaged controller with zero gain that has seen no frames.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GainState> {
        // A poisoned lock means another activity panicked mid-update.
        self.state.lock().expect("gain state poisoned")
    }

    /// Telemetry side: process one frame.
    pub fn on_frame(&self, frame: &Frame) -> Option<VelocityCommand> {
        self.lock().apply(frame)
    }

    /// Trial side: close the loop with the given gain.
    pub fn engage(&self, gain: f64) {
        let mut state = self.lock();
        state.gain = gain;
        state.enabled = true;
    }

    /// Trial side: open the loop again.
    pub fn disengage(&self) {
        self.lock().enabled = false;
    }

    /// A consistent copy of the current state.
    pub fn snapshot(&self) -> GainState {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    fn frame(frame_count: u64, heading: f64) -> Frame {
        Frame {
            frame_count,
            heading,
            timestamp: frame_count as f64,
        }
    }

    #[test]
    fn velocity_is_inverted_scaled_delta() {
        let mut state = GainState {
            enabled: true,
            gain: 50.0,
            previous_heading: Some(1.0),
        };

        let cmd = state.apply(&frame(7, 1.25)).unwrap();
        assert_eq!(cmd.reference_id, 7);
        assert_eq!(cmd.velocity, (1.25 - 1.0) * 50.0 * -1.0);
        assert_eq!(state.previous_heading, Some(1.25));
    }

    #[test]
    fn disabled_controller_tracks_heading_silently() {
        let mut state = GainState {
            enabled: false,
            gain: 10.0,
            previous_heading: Some(0.0),
        };

        assert_eq!(state.apply(&frame(1, 3.0)), None);
        assert_eq!(state.previous_heading, Some(3.0));
    }

    #[test]
    fn first_frame_never_produces_a_command() {
        let mut state = GainState {
            enabled: true,
            gain: 1.0,
            previous_heading: None,
        };

        assert_eq!(state.apply(&frame(1, 2.0)), None);
        assert!(state.apply(&frame(2, 2.5)).is_some());
    }

    #[test]
    fn reengaging_uses_the_latest_heading() {
        let controller = GainController::new();
        controller.engage(2.0);
        controller.on_frame(&frame(1, 0.0));
        assert!(controller.on_frame(&frame(2, 1.0)).is_some());

        controller.disengage();
        for (i, heading) in [5.0, 9.0, 20.0, 21.0].into_iter().enumerate() {
            assert_eq!(controller.on_frame(&frame(3 + i as u64, heading)), None);
        }

        controller.engage(2.0);
        let cmd = controller.on_frame(&frame(10, 21.5)).unwrap();
        assert_eq!(cmd.velocity, 0.5 * 2.0 * -1.0);
    }

    #[test]
    fn concurrent_updates_are_never_torn() {
        let controller = GainController::new();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20_000 {
                    match i % 3 {
                        0 => controller.engage(1.0),
                        1 => controller.engage(3.0),
                        _ => controller.disengage(),
                    }
                }
                done.store(true, Ordering::SeqCst);
            });

            s.spawn(|| {
                let mut count = 0u64;
                while !done.load(Ordering::SeqCst) {
                    // Headings climb by exactly one per frame, so every
                    // command must be one of the gains, negated.
                    if let Some(cmd) = controller.on_frame(&frame(count, count as f64)) {
                        assert!(
                            cmd.velocity == -1.0 || cmd.velocity == -3.0,
                            "torn velocity {}",
                            cmd.velocity
                        );
                    }
                    let snapshot = controller.snapshot();
                    if snapshot.enabled {
                        assert!(snapshot.gain == 1.0 || snapshot.gain == 3.0);
                    }
                    count += 1;
                }
            });
        });
    }
}
