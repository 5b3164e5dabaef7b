//! Control plane: orchestrator, state mirror, module catalog, workers

pub mod library;
pub mod manager;
pub mod state;
pub mod worker;

pub use library::*;
pub use manager::*;
pub use state::*;
pub use worker::*;
