//! Small-group mesh voice rooms.
//!
//! A lightweight relay manages room membership and forwards negotiation
//! messages; clients connect directly to each other for audio.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod media;
pub mod negotiator;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod signaling;
pub mod supervisor;
pub mod testing;

pub use config::{ClientConfig, RelayConfig};
pub use connection::{ClientStatus, Presence, StatusMonitor, SupervisorState};
pub use error::{Error, ErrorCode, ErrorKind, MediaError, NegotiationError, Result, SignalingError};
pub use supervisor::{Supervisor, SupervisorHandle};
