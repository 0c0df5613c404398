//! This crate provides the register core for talking to Marstek Venus home
//! batteries over their Modbus holding-register protocol.
//!
//! It owns the versioned register catalog (the V1/V2 map and the reworked V3
//! map), decodes raw 16-bit words into scaled engineering values, computes
//! derived metrics such as round-trip efficiency and stored energy, and
//! coordinates tiered polling with batched range reads and a serialized
//! write path.
//!
//! The crate does not own a socket. Give [`coordinator::Coordinator`] any
//! [`transport::Transport`] implementation: [`transport::ModbusLink`] frames
//! requests (RTU or TCP) over a byte stream implementing [`embedded_io`]
//! traits, or supply a register-level transport of your own, for example a
//! simulation. Ticks are external too; the host's timer calls
//! [`coordinator::Coordinator::poll_once`] with the current instant.
//!
//! Known units this should work with:
//! * Venus C
//! * Venus D
//! * Venus E
//!
//! The factory link settings are Modbus TCP on port 502, unit id 1. RS485
//! units run at 115200 8N1.

pub mod catalog;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod schedule;
pub mod transport;
pub mod value;

#[cfg(test)]
pub(crate) mod mock;

pub use catalog::{ActiveCatalog, DeviceVersion, Tier};
pub use coordinator::{CommandHandle, Coordinator, CycleReport, PollConfig, SnapshotHandle};
pub use error::{Error, Result};
pub use schedule::{ConsumerSet, TierIntervals};
pub use transport::{ModbusLink, Transport};
pub use value::{DecodedValue, Duration, Instant, Value};
