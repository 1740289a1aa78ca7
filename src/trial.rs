//! A [Trial] describes one stimulus condition: what is shown, how it moves,
//! and how long each phase lasts. Trials are built once from a sweep
//! definition and only receive their id when the runner schedules them.

use std::{fmt, time::Duration};

/// How the stimulus pattern moves during the stimulus phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    /// Constant rotation, degrees per second.
    Rotation {
        /// Signed velocity
        deg_hz: f64,
    },
    /// Sinusoidal back-and-forth movement.
    Oscillation {
        /// Hz
        freq_hz: f64,
        /// Degrees, sign sets the starting direction
        width_deg: f64,
    },
}

impl Motion {
    /// The velocity to command at stimulus onset. Oscillations are driven by
    /// the client and start from rest.
    pub fn velocity(&self) -> f64 {
        match self {
            Motion::Rotation { deg_hz } => *deg_hz,
            Motion::Oscillation { .. } => 0.0,
        }
    }
}

/// How the stimulus phase ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StimulusMode {
    /// Play for a fixed duration.
    OpenLoop(Duration),
    /// Play until the client reports that `count` sweeps were shown.
    Sweep(u32),
}

/// Closed-loop phase settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedLoop {
    /// Zero skips the phase
    pub duration: Duration,
    /// Feedback gain while the phase runs
    pub gain: f64,
    /// Bar width of the closed-loop pattern, if it differs from the stimulus
    pub bar_deg: Option<f64>,
    /// Space width of the closed-loop pattern, if it differs from the stimulus
    pub space_deg: Option<f64>,
    /// Absolute pattern position at phase entry, degrees
    pub start_position_deg: Option<f64>,
}

impl Default for ClosedLoop {
    fn default() -> Self {
        Self {
            duration: Duration::ZERO,
            gain: 1.0,
            bar_deg: None,
            space_deg: None,
            start_position_deg: None,
        }
    }
}

/// One stimulus condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    id: Option<u64>,
    /// Width of a bright bar, degrees
    pub bar_deg: f64,
    /// Width of the gap between bars, degrees
    pub space_deg: f64,
    /// Vertical extent of the bars, `None` for full height
    pub bar_height: Option<f64>,
    /// Pattern movement
    pub motion: Motion,
    /// How the stimulus phase ends
    pub mode: StimulusMode,
    /// Foreground colour, `0xRRGGBB`
    pub fg_color: u32,
    /// Background colour, `0xRRGGBB`
    pub bg_color: u32,
    /// Only every n-th display frame is rendered
    pub nth_frame: u32,
    /// Screen-off time before the stimulus
    pub pretrial: Duration,
    /// Static pattern time after the stimulus
    pub posttrial: Duration,
    /// Closed-loop phase settings
    pub closed_loop: ClosedLoop,
    /// Human readable description of the parameter combination
    pub comment: String,
}

impl Trial {
    /// Make a [TrialBuilder] with the defaults used throughout the lab's
    /// protocols.
    pub fn builder() -> TrialBuilder {
        TrialBuilder::new()
    }

    /// The scheduling id, `None` until the runner assigns one.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Assign the scheduling id.
    ///
    /// # Panics
    /// If the trial already has an id; reusing a scheduled trial is a bug.
    pub fn set_id(&mut self, id: u64) {
        assert!(
            self.id.is_none(),
            "trial {:?} scheduled twice (new id {})",
            self.id,
            id
        );
        self.id = Some(id);
    }

    /// A fresh, unscheduled copy of this condition.
    pub fn unscheduled(&self) -> Self {
        Self {
            id: None,
            ..self.clone()
        }
    }

    /// Number of bar periods around the full circle.
    pub fn spatial_frequency(&self) -> f64 {
        pattern_periods(self.bar_deg, self.space_deg)
    }

    /// Number of bar periods of the closed-loop pattern.
    pub fn closed_loop_spatial_frequency(&self) -> f64 {
        pattern_periods(
            self.closed_loop.bar_deg.unwrap_or(self.bar_deg),
            self.closed_loop.space_deg.unwrap_or(self.space_deg),
        )
    }

    /// Whether the closed-loop phase runs at all.
    pub fn has_closed_loop(&self) -> bool {
        !self.closed_loop.duration.is_zero()
    }

    /// `#RRGGBB` for the background colour.
    pub fn background_hex(&self) -> String {
        hex_color(self.bg_color)
    }

    /// `#RRGGBB` for the bar colour.
    pub fn foreground_hex(&self) -> String {
        hex_color(self.fg_color)
    }
}

fn hex_color(color: u32) -> String {
    format!("#{:06X}", color & 0xFF_FF_FF)
}

fn pattern_periods(bar_deg: f64, space_deg: f64) -> f64 {
    let period = bar_deg + space_deg;
    if period > 0.0 {
        360.0 / period
    } else {
        0.0
    }
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "trial {} ({})", id, self.comment),
            None => write!(f, "unscheduled trial ({})", self.comment),
        }
    }
}

/// Builder for [Trial].
#[derive(Debug, Clone)]
pub struct TrialBuilder {
    trial: Trial,
}

impl TrialBuilder {
    fn new() -> Self {
        Self {
            trial: Trial {
                id: None,
                bar_deg: 15.0,
                space_deg: 15.0,
                bar_height: None,
                motion: Motion::Rotation { deg_hz: 0.0 },
                mode: StimulusMode::OpenLoop(Duration::from_millis(3000)),
                fg_color: 0x00_FF_00,
                bg_color: 0x00_00_00,
                nth_frame: 1,
                pretrial: Duration::from_millis(500),
                posttrial: Duration::from_millis(500),
                closed_loop: ClosedLoop::default(),
                comment: String::new(),
            },
        }
    }

    /// Bar width in degrees. Also sets the space to the same width; call
    /// [TrialBuilder::space_deg] afterwards to override.
    pub fn bar_deg(mut self, bar_deg: f64) -> Self {
        self.trial.bar_deg = bar_deg;
        self.trial.space_deg = bar_deg;
        self
    }

    /// Gap width in degrees.
    pub fn space_deg(mut self, space_deg: f64) -> Self {
        self.trial.space_deg = space_deg;
        self
    }

    /// Vertical bar extent.
    pub fn bar_height(mut self, bar_height: Option<f64>) -> Self {
        self.trial.bar_height = bar_height;
        self
    }

    /// Rotate at a constant velocity.
    pub fn rotate_deg_hz(mut self, deg_hz: f64) -> Self {
        self.trial.motion = Motion::Rotation { deg_hz };
        self
    }

    /// Oscillate instead of rotating.
    pub fn oscillate(mut self, freq_hz: f64, width_deg: f64) -> Self {
        self.trial.motion = Motion::Oscillation { freq_hz, width_deg };
        self
    }

    /// Open-loop stimulus for a fixed time.
    pub fn stimulus_duration(mut self, duration: Duration) -> Self {
        self.trial.mode = StimulusMode::OpenLoop(duration);
        self
    }

    /// Sweep stimulus ending on the client's signal.
    pub fn sweep(mut self, count: u32) -> Self {
        self.trial.mode = StimulusMode::Sweep(count);
        self
    }

    /// Foreground and background colours, `0xRRGGBB`.
    pub fn colors(mut self, fg_color: u32, bg_color: u32) -> Self {
        self.trial.fg_color = fg_color;
        self.trial.bg_color = bg_color;
        self
    }

    /// Show only every n-th frame.
    pub fn nth_frame(mut self, nth_frame: u32) -> Self {
        self.trial.nth_frame = nth_frame.max(1);
        self
    }

    /// Screen-off time before the stimulus.
    pub fn pretrial(mut self, duration: Duration) -> Self {
        self.trial.pretrial = duration;
        self
    }

    /// Static pattern time after the stimulus.
    pub fn posttrial(mut self, duration: Duration) -> Self {
        self.trial.posttrial = duration;
        self
    }

    /// Closed-loop phase settings.
    pub fn closed_loop(mut self, closed_loop: ClosedLoop) -> Self {
        self.trial.closed_loop = closed_loop;
        self
    }

    /// Description of the condition.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.trial.comment = comment.into();
        self
    }

    /// Finish building. The result has no id yet.
    pub fn build(self) -> Trial {
        self.trial
    }
}
