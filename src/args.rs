// Commandline argument parser using clap for flyflix

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Runs a visual stimulus experiment described by a RON config file
pub struct FlyflixArgs {
    /// Experiment config to run, see `configs/` for examples
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// File the data log is appended to. Display events always go to stdout
    #[arg(short = 'd', long = "data", default_value = "flyflix-data.ron")]
    pub data: PathBuf,

    /// Overrides the telemetry UDP port from the config
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Overrides the number of repetitions from the config
    #[arg(short = 'r', long = "repetitions")]
    pub repetitions: Option<u32>,

    /// Run without listening for the sensor
    #[arg(long = "no-telemetry")]
    pub no_telemetry: bool,
}

impl FlyflixArgs {
    /// Apply the overrides to a loaded config.
    pub fn apply(&self, config: &mut crate::config::ExperimentConfig) {
        if self.no_telemetry {
            config.telemetry = None;
        } else if let Some(port) = self.port {
            config.telemetry.get_or_insert_with(Default::default).port = port;
        }
        if let Some(repetitions) = self.repetitions {
            config.repetitions = repetitions;
        }
    }
}
