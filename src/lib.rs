//! OMM Session Engine
//!
//! Watchlist and channel session layer for a publish/subscribe market data protocol. The wire
//! codec and the raw socket live outside this crate behind `ChannelTransport`; HTTP lives behind
//! `RestExchange`.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod rest;
pub mod session;
pub mod watchlist;

pub use clock::{MonotonicClock, Nanos, SimClock, SystemClock};
pub use config::{ChannelRole, WatchlistConfig};
pub use dispatch::{DispatchEvent, EventSender};
pub use error::{ErrorKind, WatchlistError};
pub use session::{ChannelEvent, ChannelState, ChannelTransport, HostDescriptor, Ioctl};
pub use watchlist::event::{EventLog, StreamEvent, StreamEventKind, WatchlistCallback, WatchlistEvent};
pub use watchlist::Watchlist;
