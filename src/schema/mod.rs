//! Schema module - Configuration, individual and run-state types.

mod config;
mod individual;
mod state;

pub use config::*;
pub use individual::*;
pub use state::*;
