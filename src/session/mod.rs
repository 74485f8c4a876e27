//! Channel Session
//!
//! Owns the connection lifecycle of the consumer channel:
//! - connect / reconnect with exponential backoff and an attempt limit
//! - preferred host fallback (manual, ioctl-driven or on a detection timer) with a single
//!   fallback to the primary when the preferred host is unreachable
//! - login gating: `UP` becomes `READY` only once the login refresh arrives
//!
//! The socket itself sits behind `ChannelTransport`.

pub mod backoff;
mod channel;
pub mod transport;

pub use backoff::BackoffCalculator;
pub use channel::{
    ChannelEvent, ChannelSession, ChannelState, HostDescriptor, Ioctl, PreferredHostOptions,
    SessionMetrics, TransitionReason,
};
pub use transport::{ChannelTransport, TransportError, TransportEvent};
