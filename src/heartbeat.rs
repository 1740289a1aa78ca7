//! Periodic `ping` events so connected displays can tell the orchestrator
//! is still alive between trials.

use crate::event::{now_ns, EventSink, Payload};

use log::debug;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

enum Signal {
    Stop,
}

/// A background thread emitting [Payload::Ping] at a fixed interval.
pub struct Heartbeat {
    handle: Option<thread::JoinHandle<u64>>,
    tx: mpsc::Sender<Signal>,
}

impl Heartbeat {
    /// Start pinging. The first ping goes out after one full interval.
    pub fn spawn(events: Arc<dyn EventSink>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();

        let handle = thread::spawn(move || {
            let mut seq = 0;
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        seq += 1;
                        events.emit(Payload::Ping {
                            seq,
                            timestamp: now_ns(),
                        });
                    }
                    Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Heartbeat stopped after {} pings", seq);
            seq
        });

        Heartbeat {
            handle: Some(handle),
            tx,
        }
    }

    /// Stop pinging and return the number of pings sent.
    pub fn stop(&mut self) -> u64 {
        // The thread may already be gone if the sender was dropped.
        let _ = self.tx.send(Signal::Stop);
        match self.handle.take() {
            Some(thread) => thread.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
