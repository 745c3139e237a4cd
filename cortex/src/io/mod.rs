//! Side-effecting collaborators of the attempt loop.

pub mod artifacts;
pub mod config;
pub mod container;
pub mod ids;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod secrets;
pub mod signals;
pub mod state_store;
pub mod tools;
