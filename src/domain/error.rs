//! GATT session errors.
//!
//! Precondition failures are detected locally and returned to the caller.
//! Link failures (`ConnectionTimeout`, `ConnectionLost`) never reach a caller;
//! the session logs them and reports a `Disconnected` event instead.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GattError>;

#[derive(Debug, Error)]
pub enum GattError {
    #[error("connection attempt timed out")]
    ConnectionTimeout,

    #[error("link to peripheral was lost")]
    ConnectionLost,

    #[error("no peripheral connected")]
    NotConnected,

    #[error("characteristic {characteristic} of service {service} not found")]
    NotFound { service: Uuid, characteristic: Uuid },

    #[error("characteristic {0} is not readable")]
    NotReadable(Uuid),

    #[error("characteristic {0} is not writable")]
    NotWritable(Uuid),

    #[error("characteristic {0} does not support notifications")]
    NotNotifiable(Uuid),

    #[error("services have not been discovered")]
    DiscoveryIncomplete,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
