//! OBD-II Scheduler for Adaptive PID Polling
//!
//! Each [`Poller`] owns the request cycle for one PID and compensates its
//! send cadence for adapter latency. Any number of pollers can share one
//! [`obd_protocol::Session`]; the session's command gate serialises them.

mod poller;

pub use poller::{next_poll_delay, Poller, PollerConfig, PollerEvent};
