//! Turns a stream of arbitrarily chunked bytes into [Frame]s.
//!
//! Lines may be split across reads, several lines may arrive in a single
//! read, and anything that is not a well formed data line is dropped on the
//! floor. A read that returns no bytes means the peer went away and ends the
//! sequence.

use crate::telemetry_message_decoder::Frame;

use log::trace;
use std::{
    io::{self, ErrorKind},
    net::UdpSocket,
    str,
    time::Duration,
};

const READ_SIZE: usize = 1024;
/// A partial line longer than this is noise and gets discarded.
pub const MAX_PENDING: usize = 4 * READ_SIZE;

/// Anything the telemetry listener can read raw sensor bytes from.
pub trait DatagramSource {
    /// Read whatever is available into `buf`. Must return an error of kind
    /// [ErrorKind::WouldBlock] or [ErrorKind::TimedOut] once the read timeout
    /// elapses, and `Ok(0)` once the peer is gone.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bound how long a single [DatagramSource::recv] may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl DatagramSource for UdpSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, Some(timeout))
    }
}

/// The result of one [FrameReader::poll].
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// A decoded frame.
    Frame(Frame),
    /// No complete frame within one read, either because the read timed
    /// out or because only part of a line (or only noise) arrived.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// `true` for the error kinds a read timeout shows up as.
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Buffers partial lines from a [DatagramSource] and yields decoded frames.
pub struct FrameReader<S: DatagramSource> {
    source: S,
    pending: Vec<u8>,
    chunk: [u8; READ_SIZE],
}

impl<S: DatagramSource> FrameReader<S> {
    /// Wrap a source. Each new connection gets a new reader.
    pub fn new(source: S) -> Self {
        Self {
            source,
            pending: Vec::new(),
            chunk: [0; READ_SIZE],
        }
    }

    /// Access the underlying source, e.g. to change its timeout.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Number of bytes buffered but not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Perform one read to find out whether anyone is sending. Bytes that
    /// arrive are kept and decoded later.
    ///
    /// `Ok(false)` means nothing answered within the timeout (or the
    /// connection was refused); errors are everything else.
    pub fn probe(&mut self) -> io::Result<bool> {
        match self.source.recv(&mut self.chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.pending.extend_from_slice(&self.chunk[..n]);
                Ok(true)
            }
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::ConnectionRefused => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Return the next buffered frame, reading from the source at most once
    /// when no complete line is buffered.
    pub fn poll(&mut self) -> io::Result<Poll> {
        if let Some(frame) = self.next_buffered() {
            return Ok(Poll::Frame(frame));
        }

        match self.source.recv(&mut self.chunk) {
            Ok(0) => return Ok(Poll::Closed),
            Ok(n) => self.pending.extend_from_slice(&self.chunk[..n]),
            Err(e) if is_timeout(&e) => return Ok(Poll::Idle),
            Err(e) => return Err(e),
        }

        // One read per poll, so a peer sending only noise cannot keep the
        // caller away from its stop checks.
        Ok(match self.next_buffered() {
            Some(frame) => Poll::Frame(frame),
            None => {
                self.discard_overlong();
                Poll::Idle
            }
        })
    }

    /// Only called with no complete line buffered.
    fn discard_overlong(&mut self) {
        if self.pending.len() > MAX_PENDING {
            trace!("Dropping {} bytes without a line break", self.pending.len());
            self.pending.clear();
        }
    }

    /// Pop complete lines until one decodes.
    fn next_buffered(&mut self) -> Option<Frame> {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            match str::from_utf8(&line) {
                Ok(s) => match s.parse::<Frame>() {
                    Ok(frame) => return Some(frame),
                    Err(e) => trace!("Dropping telemetry line ({}): {:?}", e, s),
                },
                Err(e) => trace!("Dropping non utf-8 telemetry line: {:?}", e),
            }
        }
        None
    }
}

/// Yields frames until the peer closes the connection or the source fails.
/// Idle polls are skipped, so this is only suitable for sources that
/// eventually close.
impl<S: DatagramSource> Iterator for FrameReader<S> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.poll() {
                Ok(Poll::Frame(frame)) => return Some(frame),
                Ok(Poll::Idle) => continue,
                Ok(Poll::Closed) | Err(_) => return None,
            }
        }
    }
}
