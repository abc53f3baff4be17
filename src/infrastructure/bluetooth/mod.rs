//! Bluetooth Module
//!
//! GATT client for the robot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CommandDispatcher                       │
//! │   (motion / relay commands -> profile writes)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     GattSession                          │
//! │  (state machine, descriptors, notification policy,       │
//! │   event broadcast)                                       │
//! └──────────┬────────────────────────────────▲─────────────┘
//!            │ GattTransport calls            │ TransportEvent
//!            ▼                                │
//! ┌─────────────────────────────────────────────────────────┐
//! │            BleConnection (btleplug worker)               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Bot profile UUIDs, names and command codes
//! - [`transport`] - Contract between the session and the platform
//! - [`session`] - Connection state machine
//! - [`dispatcher`] - Semantic commands
//! - [`connection`] - btleplug transport
//! - [`scanner`] - Nearby device listing

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::CommandDispatcher;
pub use session::GattSession;
