//! Flyflix drives visual stimulus experiments on tethered flies. A block of
//! stimulus conditions is generated from a declarative parameter sweep,
//! shuffled, and played back trial by trial: a blank pre-trial, the moving
//! stimulus, a static post-trial and optionally a closed-loop phase in which
//! the fly's own turning, as reported by a tracking sensor, steers the
//! pattern.
//!
//! The display itself is somebody else's problem. Everything that should
//! reach it is published as an [event::Event] on an [event::EventSink], and
//! everything worth keeping for analysis goes to an [event::DataLog].
//!
//! The pieces, roughly in the order data flows through them:
//! - [telemetry_message_decoder] and [frame_reader] turn sensor datagrams
//!   into frames,
//! - [gain_controller] turns heading changes into velocity commands,
//! - [telemetry_listener] runs the two above on a background thread,
//! - [trial] and [block] describe what to show,
//! - [trial_state_machine] plays one trial and [runner] plays whole blocks,
//! - [control_flags] carries the external start and sweep signals.

#![warn(missing_docs)]
pub mod args;
pub mod block;
pub mod config;
pub mod context;
pub mod control_flags;
pub mod error;
pub mod event;
pub mod frame_reader;
pub mod gain_controller;
pub mod heartbeat;
pub mod runner;
pub mod telemetry_listener;
pub mod telemetry_message_decoder;
pub mod trial;
pub mod trial_state_machine;
