//! Database module for netpulse.
//!
//! SQLite storage for persisted readings and user settings.

mod sink;
mod store;

pub use sink::*;
pub use store::*;
