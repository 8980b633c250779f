pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{BottleError, Result};
