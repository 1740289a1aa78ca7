//! Process-wide flags shared by the telemetry listener, the trial runner and
//! whatever delivers external control signals.

use std::{
    fmt,
    str::FromStr,
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, info};

/// A control signal from the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// The experimenter pressed start.
    Start,
    /// The display client finished the requested number of sweeps.
    SweepCounterReached,
    /// A display client connected.
    ClientConnected(String),
    /// A display client went away.
    ClientDisconnected(String),
}

/// Returned when a line of text is not a known control signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSignal(pub String);

impl fmt::Display for UnknownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown control signal {:?}", self.0)
    }
}

impl std::error::Error for UnknownSignal {}

impl FromStr for ControlSignal {
    type Err = UnknownSignal;

    /// Accepts the names the display client uses: `start-experiment`,
    /// `sweep-counter`, `connect <id>` and `disconnect <id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let signal = match (words.next(), words.next()) {
            (Some("start") | Some("start-experiment"), None) => ControlSignal::Start,
            (Some("sweep-counter") | Some("sweep-counter-reached"), None) => {
                ControlSignal::SweepCounterReached
            }
            (Some("connect"), id) => ControlSignal::ClientConnected(id.unwrap_or("").to_owned()),
            (Some("disconnect"), id) => {
                ControlSignal::ClientDisconnected(id.unwrap_or("").to_owned())
            }
            _ => return Err(UnknownSignal(s.trim().to_owned())),
        };
        Ok(signal)
    }
}

#[derive(Debug, Default)]
struct Flags {
    started: bool,
    sweep_reached: bool,
    telemetry_active: bool,
}

/// The flags live behind one lock; waiters are woken through a condition
/// variable whenever any flag changes.
#[derive(Debug, Default)]
pub struct ControlFlags {
    flags: Mutex<Flags>,
    changed: Condvar,
}

impl ControlFlags {
    /// All flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().expect("control flags poisoned")
    }

    fn update(&self, f: impl FnOnce(&mut Flags)) {
        f(&mut *self.lock());
        self.changed.notify_all();
    }

    /// Route an external signal to the flag it controls.
    pub fn apply(&self, signal: &ControlSignal) {
        match signal {
            ControlSignal::Start => self.set_started(),
            ControlSignal::SweepCounterReached => self.signal_sweep_reached(),
            ControlSignal::ClientConnected(id) => info!("Client connected {}", id),
            ControlSignal::ClientDisconnected(id) => info!("Client disconnected {}", id),
        }
    }

    /// Latch `started`. It is never cleared again.
    pub fn set_started(&self) {
        debug!("Start signal received");
        self.update(|f| f.started = true);
    }

    /// Current value of `started`.
    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// Block until `started` is set. This is the only unbounded wait.
    pub fn wait_started(&self) {
        let guard = self.lock();
        let _guard = self
            .changed
            .wait_while(guard, |f| !f.started)
            .expect("control flags poisoned");
    }

    /// Set `sweep_reached`.
    pub fn signal_sweep_reached(&self) {
        self.update(|f| f.sweep_reached = true);
    }

    /// Clear `sweep_reached` before asking the client for a new sweep.
    pub fn reset_sweep_reached(&self) {
        self.update(|f| f.sweep_reached = false);
    }

    /// Current value of `sweep_reached`.
    pub fn sweep_reached(&self) -> bool {
        self.lock().sweep_reached
    }

    /// Wait until `sweep_reached` is set, then consume it. There is no
    /// timeout: the sweep ends when the client says so. `poll` bounds how
    /// long a single wait lasts before the flag is re-checked.
    pub fn wait_sweep_reached(&self, poll: Duration) {
        let mut guard = self.lock();
        while !guard.sweep_reached {
            guard = self
                .changed
                .wait_timeout(guard, poll)
                .expect("control flags poisoned")
                .0;
        }
        guard.sweep_reached = false;
    }

    /// Ask the telemetry listener to keep running (`true`) or to stop.
    pub fn set_telemetry_active(&self, active: bool) {
        self.update(|f| f.telemetry_active = active);
    }

    /// Whether the telemetry listener should keep iterating.
    pub fn telemetry_active(&self) -> bool {
        self.lock().telemetry_active
    }
}
