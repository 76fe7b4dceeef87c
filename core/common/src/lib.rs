//! Common utilities and types shared across SkySync modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::ActionId;
