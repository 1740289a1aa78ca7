//! Handles every activity of an experiment needs: where events and data
//! records go, the shared control flags, and the closed-loop controller.

use crate::{
    control_flags::ControlFlags,
    event::{DataLog, EventSink, LogRecord, MemorySink, Payload},
    gain_controller::GainController,
};

use std::{sync::Arc, time::Duration};

/// Default wait step for phase deadlines and latch polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cheap to clone; all clones share the same sinks, flags and controller.
#[derive(Clone)]
pub struct ExperimentContext {
    /// Display events
    pub events: Arc<dyn EventSink>,
    /// Experiment data log
    pub data: Arc<dyn DataLog>,
    /// Shared control flags
    pub flags: Arc<ControlFlags>,
    /// Closed-loop controller
    pub gain: GainController,
    /// Wait step for deadlines and latches
    pub poll_interval: Duration,
}

impl ExperimentContext {
    /// Build a context with fresh flags and a fresh controller.
    pub fn new(events: Arc<dyn EventSink>, data: Arc<dyn DataLog>) -> Self {
        Self {
            events,
            data,
            flags: Arc::new(ControlFlags::new()),
            gain: GainController::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// A context whose events and records all land in one [MemorySink],
    /// returned alongside so the caller can inspect it.
    pub fn in_memory() -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Self::new(sink.clone(), sink.clone()), sink)
    }

    /// Override the wait step.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publish a display event.
    pub fn emit(&self, payload: Payload) {
        self.events.emit(payload);
    }

    /// Append a server record to the data log.
    pub fn record(&self, record: LogRecord) {
        self.data.record(record);
    }
}
