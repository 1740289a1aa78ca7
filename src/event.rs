//! Events published to the display client and records appended to the
//! experiment data log.
//!
//! Both destinations are external collaborators. The core only knows the two
//! traits defined here, [EventSink] and [DataLog], and treats them as
//! fire-and-forget: publishing never fails from the caller's point of view.

use log::warn;
use serde::Serialize;
use std::{
    fmt,
    io::Write,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

/// Nanoseconds since the Unix epoch, the timestamp unit of every event and
/// data log record.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// A loosely typed value carried by `meta` events and data log records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// No value, used for pure markers such as `post-trial-end`.
    Empty,
    /// A boolean flag.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// Free text.
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// What an [Event] says. The serialized variant name is the event name the
/// display client listens for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    /// Set the stimulus rotation velocity. `reference_id` is a trial id for
    /// open-loop commands and a sensor frame count for closed-loop commands.
    #[serde(rename = "speed")]
    Speed {
        /// Trial id or frame count the command refers to
        reference_id: u64,
        /// Degrees per second, sign encodes direction
        velocity: f64,
    },

    /// Switch the screen on or off, optionally with a background colour.
    #[serde(rename = "screen")]
    Screen {
        /// `true` shows the pattern, `false` blanks the screen
        on: bool,
        /// Background colour as `#RRGGBB`
        background: Option<String>,
    },

    /// Bar colour as `#RRGGBB`.
    #[serde(rename = "foreground")]
    Foreground(String),

    /// Vertical bar extent as a fraction of the screen, `None` for full
    /// height.
    #[serde(rename = "barheight")]
    BarHeight(Option<f64>),

    /// Number of bar periods around the arena.
    #[serde(rename = "spatfreq")]
    SpatFreq(f64),

    /// Reset the client's sweep counter to the given number of sweeps.
    #[serde(rename = "sweepcount")]
    SweepCount(u32),

    /// Only render every n-th frame.
    #[serde(rename = "nthframe")]
    NthFrame(u32),

    /// Free-form key/value annotation, also used for phase transitions.
    #[serde(rename = "meta")]
    Meta {
        /// Time the annotation was produced
        timestamp: u64,
        /// What is being annotated
        key: String,
        /// Annotation value
        value: Value,
    },

    /// Jump the pattern to an absolute angle.
    #[serde(rename = "rotate-to")]
    RotateTo {
        /// Trial id the command refers to
        reference_id: u64,
        /// Radians
        angle: f64,
    },

    /// Oscillate the pattern instead of rotating it.
    #[serde(rename = "oscillation")]
    Oscillation {
        /// Trial id the command refers to
        reference_id: u64,
        /// Hz
        frequency: f64,
        /// Peak to peak amplitude in degrees, sign encodes starting direction
        width: f64,
    },

    /// Heartbeat used to measure client round-trip times.
    #[serde(rename = "ping")]
    Ping {
        /// Monotonic heartbeat sequence number
        seq: u64,
        /// Time the ping was sent
        timestamp: u64,
    },
}

impl Payload {
    /// Convenience constructor for a `meta` payload stamped with the current time.
    pub fn meta(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Payload::Meta {
            timestamp: now_ns(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// The event name the display client knows this payload by.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Speed { .. } => "speed",
            Payload::Screen { .. } => "screen",
            Payload::Foreground(_) => "foreground",
            Payload::BarHeight(_) => "barheight",
            Payload::SpatFreq(_) => "spatfreq",
            Payload::SweepCount(_) => "sweepcount",
            Payload::NthFrame(_) => "nthframe",
            Payload::Meta { .. } => "meta",
            Payload::RotateTo { .. } => "rotate-to",
            Payload::Oscillation { .. } => "oscillation",
            Payload::Ping { .. } => "ping",
        }
    }

    /// The key of a `meta` payload, `None` for every other kind.
    pub fn meta_key(&self) -> Option<&str> {
        match self {
            Payload::Meta { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// An immutable, timestamped message for the display client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Nanoseconds since the Unix epoch at publication time
    pub timestamp: u64,
    /// What happened
    pub payload: Payload,
}

impl Event {
    /// Stamp a payload with the current time.
    pub fn now(payload: Payload) -> Self {
        Self {
            timestamp: now_ns(),
            payload,
        }
    }

    /// Shorthand for `self.payload.name()`.
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// One row of the experiment data log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Who produced the record, `server` for everything the core writes
    pub subject_id: String,
    /// Timestamp reported by a client, zero when the server is the producer
    pub client_timestamp: u64,
    /// Server timestamp that initiated the record
    pub request_timestamp: u64,
    /// What is being recorded
    pub key: String,
    /// Recorded value
    pub value: Value,
}

impl LogRecord {
    /// A record produced by the server itself, stamped with the current time.
    pub fn server(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::server_at(now_ns(), key, value)
    }

    /// A record produced by the server with an explicit shared timestamp, so
    /// several records can be correlated offline.
    pub fn server_at(request_timestamp: u64, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            subject_id: "server".to_owned(),
            client_timestamp: 0,
            request_timestamp,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Receives display events. Ordering is preserved per producer only.
pub trait EventSink: Send + Sync {
    /// Hand an event to the transport. Must not block for long.
    fn publish(&self, event: Event);

    /// Stamp `payload` with the current time and publish it.
    fn emit(&self, payload: Payload) {
        self.publish(Event::now(payload));
    }
}

/// Append-only experiment data log. The core never reads it back.
pub trait DataLog: Send + Sync {
    /// Append a record.
    fn record(&self, record: LogRecord);
}

/// Keeps everything it is given in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event published so far, in publication order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event buffer poisoned").clone()
    }

    /// Copy of every data log record so far, in append order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("record buffer poisoned").clone()
    }

    /// Keys of all `meta` events, in publication order.
    pub fn meta_keys(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.payload.meta_key().map(str::to_owned))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: Event) {
        self.events.lock().expect("event buffer poisoned").push(event);
    }
}

impl DataLog for MemorySink {
    fn record(&self, record: LogRecord) {
        self.records.lock().expect("record buffer poisoned").push(record);
    }
}

/// Writes one RON document per line to any [Write]r.
pub struct RonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> RonSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn write_line<T: Serialize>(&self, value: &T) {
        let line = match ron::ser::to_string(value) {
            Ok(line) => line,
            Err(error) => {
                warn!("Unable to serialize record: {}", error);
                return;
            }
        };
        let mut writer = self.writer.lock().expect("sink writer poisoned");
        if let Err(error) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Unable to write record: {}", error);
        }
    }
}

impl<W: Write + Send> EventSink for RonSink<W> {
    fn publish(&self, event: Event) {
        self.write_line(&event);
    }
}

impl<W: Write + Send> DataLog for RonSink<W> {
    fn record(&self, record: LogRecord) {
        self.write_line(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_names_match_wire_names() {
        let payloads = [
            (Payload::Speed { reference_id: 1, velocity: 2.0 }, "speed"),
            (Payload::Screen { on: true, background: None }, "screen"),
            (Payload::Foreground("#00BE00".to_owned()), "foreground"),
            (Payload::BarHeight(Some(0.03)), "barheight"),
            (Payload::SpatFreq(4.0), "spatfreq"),
            (Payload::SweepCount(2), "sweepcount"),
            (Payload::NthFrame(1), "nthframe"),
            (Payload::meta("fly", 236u64), "meta"),
            (Payload::RotateTo { reference_id: 1, angle: 0.5 }, "rotate-to"),
        ];
        for (payload, name) in payloads {
            assert_eq!(payload.name(), name);
            let serialized = ron::ser::to_string(&payload).unwrap();
            assert!(serialized.contains(name), "{} vs {}", serialized, name);
        }
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.emit(Payload::meta("first", 1u64));
        sink.emit(Payload::SweepCount(3));
        sink.emit(Payload::meta("second", 2u64));

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.meta_keys(), vec!["first", "second"]);
    }

    #[test]
    fn ron_sink_writes_one_line_per_record() {
        let sink = RonSink::new(Vec::new());
        sink.record(LogRecord::server("fly", 236u64));
        sink.record(LogRecord::server("sex", "f"));
        sink.emit(Payload::NthFrame(2));

        let written = String::from_utf8(sink.writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("key:\"fly\""));
        assert!(lines[0].contains("value:236"));
        assert!(lines[2].contains("nthframe(2)"));
    }
}
