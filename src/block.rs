//! Expands a declarative parameter sweep into a [Block] of [Trial]s.
//!
//! A [BlockDefinition] is a list of [SweepSection]s. Each section names a
//! stimulus kind and a set of [Axes]; the section contributes one trial per
//! element of the Cartesian product of its axes, in declaration order. The
//! block is the concatenation of all sections and is never shuffled here;
//! randomisation is the runner's job.

use crate::trial::{ClosedLoop, Trial};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An ordered sequence of unscheduled trials.
pub type Block = Vec<Trial>;

/// How the stimulus of a section moves and ends.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum StimulusKind {
    /// Rotate at `bar_deg * 2 * speed * direction` for the stimulus duration.
    Rotation,
    /// Oscillate at `speed` Hz over `width_deg * direction`.
    Oscillation {
        /// Amplitude before the direction sign is applied
        width_deg: f64,
    },
    /// Rotate like [StimulusKind::Rotation] until the client has shown
    /// `count` sweeps.
    Sweep {
        /// Sweeps to show
        count: u32,
    },
}

/// How the gap between bars is derived from the bar width.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum SpaceRule {
    /// Gap as wide as the bar.
    SameAsBar,
    /// A fixed gap.
    Fixed(f64),
    /// Bar and gap add up to the given width.
    Complement(f64),
}

impl SpaceRule {
    fn space_for(&self, bar_deg: f64) -> f64 {
        match *self {
            SpaceRule::SameAsBar => bar_deg,
            SpaceRule::Fixed(space) => space,
            SpaceRule::Complement(total) => total - bar_deg,
        }
    }
}

/// A background/foreground brightness pair, 0-255. The colour is rendered
/// in the green channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColorPair {
    /// Background brightness
    pub background: u8,
    /// Foreground brightness
    pub foreground: u8,
}

impl ColorPair {
    /// Michelson contrast rounded to one decimal.
    pub fn contrast(&self) -> f64 {
        let fg = self.foreground as f64;
        let bg = self.background as f64;
        if fg + bg == 0.0 {
            return 0.0;
        }
        ((fg - bg) / (fg + bg) * 10.0).round() / 10.0
    }

    fn green(brightness: u8) -> u32 {
        (brightness as u32) << 8
    }
}

/// The swept dimensions. Empty lists for the optional axes mean "a single
/// neutral value" so they do not multiply the trial count.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Axes {
    /// Bar widths in degrees
    pub bar_deg: Vec<f64>,
    /// Temporal frequencies in Hz
    pub speeds: Vec<f64>,
    /// Direction signs, defaults to `[1.0]`
    #[serde(default = "Axes::default_directions")]
    pub directions: Vec<f64>,
    /// Colour pairs, defaults to bright green on black
    #[serde(default = "Axes::default_colors")]
    pub colors: Vec<ColorPair>,
    /// Closed-loop gains, defaults to `[1.0]`
    #[serde(default = "Axes::default_gains")]
    pub gains: Vec<f64>,
    /// Closed-loop start positions in degrees, empty for none
    #[serde(default)]
    pub start_positions: Vec<f64>,
}

impl Axes {
    fn default_directions() -> Vec<f64> {
        vec![1.0]
    }

    fn default_colors() -> Vec<ColorPair> {
        vec![ColorPair {
            background: 0,
            foreground: 255,
        }]
    }

    fn default_gains() -> Vec<f64> {
        vec![1.0]
    }

    /// Number of combinations this set of axes expands to.
    pub fn combinations(&self) -> usize {
        self.bar_deg.len()
            * self.speeds.len()
            * self.directions.len()
            * self.colors.len()
            * self.gains.len()
            * self.start_positions.len().max(1)
    }
}

/// Phase durations of a section, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct DurationsMs {
    /// Screen-off time before the stimulus
    #[serde(default = "DurationsMs::default_pretrial")]
    pub pretrial: u64,
    /// Open-loop stimulus time, ignored for sweeps
    #[serde(default = "DurationsMs::default_stimulus")]
    pub stimulus: u64,
    /// Static pattern time after the stimulus
    #[serde(default = "DurationsMs::default_posttrial")]
    pub posttrial: u64,
    /// Closed-loop time, zero skips the phase
    #[serde(default)]
    pub closed_loop: u64,
}

impl DurationsMs {
    fn default_pretrial() -> u64 {
        500
    }

    fn default_stimulus() -> u64 {
        3000
    }

    fn default_posttrial() -> u64 {
        500
    }
}

impl Default for DurationsMs {
    fn default() -> Self {
        Self {
            pretrial: Self::default_pretrial(),
            stimulus: Self::default_stimulus(),
            posttrial: Self::default_posttrial(),
            closed_loop: 0,
        }
    }
}

/// The closed-loop pattern of a section, if it differs from the stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct ClosedLoopPattern {
    /// Bar width, degrees
    pub bar_deg: Option<f64>,
    /// Gap width, degrees
    pub space_deg: Option<f64>,
}

/// One family of conditions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SweepSection {
    /// Prefix of every generated trial comment
    pub label: String,
    /// How the stimulus moves
    pub stimulus: StimulusKind,
    /// Swept dimensions
    pub axes: Axes,
    /// Gap width rule
    #[serde(default = "SweepSection::default_space")]
    pub space: SpaceRule,
    /// Vertical bar extent, `None` for full height
    #[serde(default)]
    pub bar_height: Option<f64>,
    /// Show only every n-th frame
    #[serde(default = "SweepSection::default_nth_frame")]
    pub nth_frame: u32,
    /// Phase durations
    #[serde(default)]
    pub durations: DurationsMs,
    /// Closed-loop pattern overrides
    #[serde(default)]
    pub closed_loop: ClosedLoopPattern,
}

impl SweepSection {
    fn default_space() -> SpaceRule {
        SpaceRule::SameAsBar
    }

    fn default_nth_frame() -> u32 {
        1
    }

    /// Expand this section into its trials.
    pub fn generate(&self) -> Block {
        let axes = &self.axes;
        let start_positions: Vec<Option<f64>> = if axes.start_positions.is_empty() {
            vec![None]
        } else {
            axes.start_positions.iter().copied().map(Some).collect()
        };

        let mut block = Vec::with_capacity(axes.combinations());
        for &bar in &axes.bar_deg {
            for &speed in &axes.speeds {
                for &direction in &axes.directions {
                    for &colors in &axes.colors {
                        for &gain in &axes.gains {
                            for &start in &start_positions {
                                block.push(self.trial(bar, speed, direction, colors, gain, start));
                            }
                        }
                    }
                }
            }
        }
        block
    }

    fn trial(
        &self,
        bar: f64,
        speed: f64,
        direction: f64,
        colors: ColorPair,
        gain: f64,
        start: Option<f64>,
    ) -> Trial {
        let d = &self.durations;
        let builder = Trial::builder()
            .bar_deg(bar)
            .space_deg(self.space.space_for(bar))
            .bar_height(self.bar_height)
            .colors(
                ColorPair::green(colors.foreground),
                ColorPair::green(colors.background),
            )
            .nth_frame(self.nth_frame)
            .pretrial(Duration::from_millis(d.pretrial))
            .posttrial(Duration::from_millis(d.posttrial))
            .closed_loop(ClosedLoop {
                duration: Duration::from_millis(d.closed_loop),
                gain,
                bar_deg: self.closed_loop.bar_deg,
                space_deg: self.closed_loop.space_deg,
                start_position_deg: start,
            });

        let rotation = bar * 2.0 * speed * direction;
        let builder = match self.stimulus {
            StimulusKind::Rotation => builder
                .rotate_deg_hz(rotation)
                .stimulus_duration(Duration::from_millis(d.stimulus)),
            StimulusKind::Oscillation { width_deg } => builder
                .oscillate(speed, width_deg * direction)
                .stimulus_duration(Duration::from_millis(d.stimulus)),
            StimulusKind::Sweep { count } => builder.rotate_deg_hz(rotation).sweep(count),
        };

        let mut comment = format!(
            "{} bar {} speed {} direction {} brightness {} contrast {}",
            self.label,
            bar,
            speed,
            direction,
            colors.foreground,
            colors.contrast()
        );
        if d.closed_loop > 0 {
            comment.push_str(&format!(" gain {}", gain));
        }
        if let Some(start) = start {
            comment.push_str(&format!(" start {}", start));
        }

        builder.comment(comment).build()
    }
}

/// A full block: the concatenation of its sections.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlockDefinition {
    /// Sections in the order their trials appear in the block
    pub sections: Vec<SweepSection>,
}

impl BlockDefinition {
    /// Expand every section.
    pub fn generate(&self) -> Block {
        self.sections.iter().flat_map(SweepSection::generate).collect()
    }
}
