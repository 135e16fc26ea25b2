#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

//! Mediation engine for a low-power radio mesh gateway.
//!
//! A single physical device exposes a framed byte-stream protocol; this
//! crate attaches to that stream, drives the device request/response
//! lifecycle, maintains the durable mesh model, runs the automation loops
//! and re-serves the stream to auxiliary clients as a virtual device.

pub mod channel_url;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod proto;
pub mod sched;
pub mod script;
pub mod session;
pub mod state;
pub mod vdev;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};

/// Default TCP port of the physical gateway protocol.
pub const DEFAULT_DEVICE_PORT: u16 = 4403;

/// Channel sentinel marking a message as direct, irrespective of the
/// transport channel it actually traversed.
pub const DM_CHANNEL: i32 = -1;
