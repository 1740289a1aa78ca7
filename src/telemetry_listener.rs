//! The background activity that owns the sensor socket.
//!
//! It probes once for the sensor, then decodes frames for as long as the
//! `telemetry_active` flag is set, feeding each one through the gain
//! controller and publishing the resulting velocity commands immediately.
//! Frames are never queued.

use crate::{
    config::TelemetryConfig,
    context::ExperimentContext,
    error::FlyflixError,
    event::{now_ns, LogRecord, Payload},
    frame_reader::{DatagramSource, FrameReader, Poll},
    telemetry_message_decoder::Frame,
};

use log::{debug, error, info, warn};
use std::{
    net::UdpSocket,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Why the listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// Nothing answered the initial probe.
    SensorAbsent,
    /// The sensor stopped sending (zero-byte read).
    Closed,
    /// `telemetry_active` was cleared.
    Stopped,
}

/// Timeouts the listener applies to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerTiming {
    /// Bound on the initial probe read
    pub probe_timeout: Duration,
    /// Bound on every later read; also how stale the stop flag may get
    pub receive_timeout: Duration,
}

impl From<&TelemetryConfig> for ListenerTiming {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            receive_timeout: config.receive_timeout(),
        }
    }
}

/// A running listener. Stop it with [TelemetryListener::stop].
pub struct TelemetryListener {
    handle: Option<JoinHandle<Result<ListenerExit, FlyflixError>>>,
    ctx: ExperimentContext,
}

impl TelemetryListener {
    /// Bind the configured UDP address and start listening on a new thread.
    ///
    /// Failing to bind is an error; a sensor that is simply not running is
    /// not, and only shows up as a `telemetry-connect-fail` event.
    pub fn spawn(config: &TelemetryConfig, ctx: ExperimentContext) -> Result<Self, FlyflixError> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port))?;
        info!("Listening for telemetry on {}:{}", config.host, config.port);
        Ok(Self::spawn_with_source(socket, ListenerTiming::from(config), ctx))
    }

    /// Start listening on any source.
    pub fn spawn_with_source<S>(source: S, timing: ListenerTiming, ctx: ExperimentContext) -> Self
    where
        S: DatagramSource + Send + 'static,
    {
        ctx.flags.set_telemetry_active(true);
        let th_ctx = ctx.clone();
        let handle = thread::spawn(move || listen(source, timing, &th_ctx));
        Self {
            handle: Some(handle),
            ctx,
        }
    }

    /// Whether the listener thread has already ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Clear `telemetry_active` and wait for the thread, which notices
    /// within one receive timeout.
    pub fn stop(&mut self) -> Result<ListenerExit, FlyflixError> {
        self.ctx.flags.set_telemetry_active(false);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| FlyflixError::JoinError)?,
            None => Ok(ListenerExit::Stopped),
        }
    }
}

impl Drop for TelemetryListener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                warn!("Telemetry listener ended with an error: {}", e);
            }
        }
    }
}

fn listen<S: DatagramSource>(
    mut source: S,
    timing: ListenerTiming,
    ctx: &ExperimentContext,
) -> Result<ListenerExit, FlyflixError> {
    let shared_key = now_ns();
    source
        .set_read_timeout(timing.probe_timeout)
        .map_err(FlyflixError::Telemetry)?;
    let mut reader = FrameReader::new(source);

    match reader.probe() {
        Ok(true) => {
            info!("Telemetry sensor detected");
            ctx.emit(Payload::Meta {
                timestamp: shared_key,
                key: "telemetry-connect-ok".to_owned(),
                value: 1u64.into(),
            });
        }
        Ok(false) => {
            warn!("Telemetry sensor is not running, continuing without closed-loop feedback");
            ctx.emit(Payload::Meta {
                timestamp: shared_key,
                key: "telemetry-connect-fail".to_owned(),
                value: 0u64.into(),
            });
            return Ok(ListenerExit::SensorAbsent);
        }
        Err(e) => {
            error!("Telemetry probe failed: {}", e);
            return Err(FlyflixError::Telemetry(e));
        }
    }

    reader
        .source_mut()
        .set_read_timeout(timing.receive_timeout)
        .map_err(FlyflixError::Telemetry)?;

    while ctx.flags.telemetry_active() {
        match reader.poll() {
            Ok(Poll::Frame(frame)) => on_frame(&frame, shared_key, ctx),
            Ok(Poll::Idle) => continue,
            Ok(Poll::Closed) => {
                info!("Telemetry sensor closed the connection");
                return Ok(ListenerExit::Closed);
            }
            Err(e) => {
                error!("Telemetry read failed: {}", e);
                return Err(FlyflixError::Telemetry(e));
            }
        }
    }

    info!("Telemetry listener stopped");
    Ok(ListenerExit::Stopped)
}

fn on_frame(frame: &Frame, shared_key: u64, ctx: &ExperimentContext) {
    ctx.emit(Payload::Meta {
        timestamp: shared_key,
        key: "telemetry-frame".to_owned(),
        value: frame.frame_count.into(),
    });
    ctx.record(LogRecord::server_at(
        frame.timestamp as u64,
        "heading",
        frame.heading,
    ));

    if let Some(cmd) = ctx.gain.on_frame(frame) {
        debug!("Frame {} -> velocity {}", cmd.reference_id, cmd.velocity);
        ctx.record(LogRecord::server_at(
            cmd.reference_id,
            "closed-loop-speed",
            cmd.velocity,
        ));
        ctx.emit(Payload::Speed {
            reference_id: cmd.reference_id,
            velocity: cmd.velocity,
        });
    }
}
