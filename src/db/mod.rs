//! Database module for netsensor.
//!
//! SQLite log of every step and service test result.

mod models;
mod store;

pub use models::*;
pub use store::*;
