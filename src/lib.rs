//! Connection supervisor and command pipeline for LG webOS TVs.
//!
//! webOS TVs drop their control socket constantly: they power down into
//! standby, lose wifi, or are flat-out off until a wake-on-LAN packet
//! arrives. This crate keeps one persistent [`TvDevice`] handle alive per
//! TV regardless, on top of a pluggable session transport:
//!
//! - a connect critical section so concurrent triggers collapse into one
//!   handshake ([`device`])
//! - a bounded reconnect loop that resends magic packets while a wake is
//!   pending ([`wol`])
//! - a deferred-command buffer with lifetime expiry, replayed on reconnect
//!   ([`buffer`])
//! - a state snapshot and differ that turns full TV reports into minimal
//!   update events ([`snapshot`])
//! - a dispatcher that resolves every command to a [`CmdStatus`] instead of
//!   leaking transport errors ([`command`], [`error`])
//!
//! The wire protocol itself lives behind [`transport::TvSession`]; hosts
//! plug in a real SSAP client and receive lifecycle and state events
//! through an [`events::EventEmitter`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use weboslink::{DeviceRegistry, LoggingEventEmitter, TvConfig, UdpWakeSender};
//! # fn factory() -> Arc<dyn weboslink::SessionFactory> { unimplemented!() }
//!
//! # async fn run() {
//! let registry = DeviceRegistry::new(
//!     factory(),
//!     Arc::new(LoggingEventEmitter),
//!     Arc::new(UdpWakeSender),
//!     None,
//! );
//! let tv = registry.add(TvConfig::new("Living room", "192.168.1.20"), true).unwrap();
//! tv.set_volume(Some(12)).await;
//! # }
//! ```

pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod registry;
pub mod snapshot;
pub mod transport;
pub mod wol;

pub use buffer::{CommandBuffer, BUFFER_LIFETIME};
pub use command::{RetryPolicy, TvCommand, DEFAULT_COMMAND_TIMEOUT};
pub use config::{ConfigError, ConfigStore, TvConfig};
pub use device::{DevicePower, TvDevice, CONNECTION_RETRIES, RETRY_INTERVAL};
pub use error::{CmdStatus, LinkError, LinkResult};
pub use events::{
    BroadcastEventEmitter, DeviceEvent, EventEmitter, LoggingEventEmitter, NoopEventEmitter,
};
pub use registry::DeviceRegistry;
pub use snapshot::{MediaKind, PlaybackState, StateDelta, TvAttributes, TvSnapshot};
pub use transport::{
    AppInfo, InputInfo, PowerReport, SessionError, SessionFactory, TvReport, TvSession,
};
pub use wol::{UdpWakeSender, WakeSender};
