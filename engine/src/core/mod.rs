//! ReelPilot Core Engine
//!
//! Provider selection, cost estimation, budget governance and dispatch.

pub mod budget;
pub mod clock;
pub mod generative;
pub mod persistence;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scenarios;
