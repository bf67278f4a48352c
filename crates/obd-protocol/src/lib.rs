//! OBD-II Protocol Implementation
//!
//! Talks to ELM327-compatible adapters over any async byte stream:
//!
//! - [`PidRegistry`] maps PID codes to [`PidDescriptor`]s that decode replies
//! - [`FrameParser`] reassembles prompt-terminated responses from raw chunks
//! - [`CommandGate`] keeps exactly one command on the wire at a time
//! - [`Session`] ties them together around a host-supplied [`Connector`]

pub mod config;
mod connector;
mod error;
mod gate;
pub mod mock;
pub mod parser;
pub mod pid;
pub mod protocol;
mod registry;
mod session;
mod signal;

pub use config::SessionConfig;
pub use connector::{Connector, SerialConnector, StreamConnector, TcpConnector, Transport};
pub use error::ObdError;
pub use gate::CommandGate;
pub use parser::FrameParser;
pub use pid::{PidDescriptor, PidValue};
pub use protocol::ObdProtocol;
pub use registry::{PidInfo, PidRegistry};
pub use session::{Connection, ObdEvent, Session, SignalWatch};
pub use signal::Signal;

/// OBD-II request modes, as sent on the wire
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: &str = "01";
}
