//! Command Gate
//!
//! The adapter processes one command at a time and only signals completion
//! by printing its prompt. The gate therefore keeps at most one command on
//! the wire: a write while locked is queued, and each completed frame
//! releases the next queued command.
//!
//! A command whose prompt does not arrive in time is not abandoned at once.
//! The gate first drains for one more timeout period, so a late prompt is
//! taken as the end of that command and never as the reply to the next one.
//! Only when the drain period also expires is the prompt considered lost.
//!
//! The gate is a plain state machine. It never touches the transport itself;
//! it returns the bytes that must be written, and the connection task that
//! owns both the gate and the transport does the writing.

use crate::protocol::frame_command;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct InFlight {
    command: String,
    since: Instant,
    draining: bool,
}

/// Serializes commands to the adapter
#[derive(Debug, Default)]
pub struct CommandGate {
    current: Option<InFlight>,
    pending: VecDeque<String>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a command.
    ///
    /// If the gate is free it locks and returns the framed bytes to write
    /// now. Otherwise the raw command is queued and `None` is returned.
    /// Empty commands are ignored.
    pub fn write(&mut self, msg: String) -> Option<Vec<u8>> {
        if msg.is_empty() {
            warn!("Ignoring empty command");
            return None;
        }
        if self.is_locked() {
            debug!("Gate is locked, queueing message {:?}", msg);
            self.pending.push_back(msg);
            return None;
        }
        let framed = frame_command(&msg);
        debug!("Writing message {:?}, gate will lock", framed);
        self.current = Some(InFlight {
            command: msg,
            since: Instant::now(),
            draining: false,
        });
        Some(framed.into_bytes())
    }

    /// The adapter finished a response: unlock and release the next command.
    ///
    /// A released command goes through the same path as [`write`](Self::write),
    /// so it is framed and re-locks the gate.
    pub fn on_line_break(&mut self) -> Option<Vec<u8>> {
        if let Some(late) = self.current.take().filter(|c| c.draining) {
            debug!("Late prompt for {:?}", late.command);
        }
        debug!("Gate unlocked");
        let msg = self.pending.pop_front()?;
        debug!("Writing queued message {:?}", msg);
        self.write(msg)
    }

    /// The deadline passed without a prompt.
    ///
    /// The first expiry only starts draining and returns `None`. A second
    /// expiry gives the prompt up as lost and releases the next command.
    pub fn on_timeout(&mut self) -> Option<Vec<u8>> {
        match self.current.as_mut() {
            Some(current) if !current.draining => {
                warn!("No prompt for {:?}, draining", current.command);
                current.draining = true;
                current.since = Instant::now();
                None
            }
            Some(current) => {
                warn!("Prompt for {:?} lost, releasing gate", current.command);
                self.on_line_break()
            }
            None => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.current.is_some()
    }

    /// Waiting out a late prompt after a timeout
    pub fn is_draining(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.draining)
    }

    /// The command currently on the wire
    pub fn current(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.command.as_str())
    }

    /// Start of the current wait: the write, or the start of draining
    pub fn locked_since(&self) -> Option<Instant> {
        self.current.as_ref().map(|c| c.since)
    }

    /// Number of commands waiting for the gate
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
