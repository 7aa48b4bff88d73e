//! # Wharf core
//!
//! Shared error types, the injectable clock and the durability settings used
//! by every Wharf crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod clock;
pub mod error;
pub mod result;
pub mod settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Error;
pub use result::{Result, ResultExt};
pub use settings::{DurabilitySettings, millis};
