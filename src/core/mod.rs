//! Core data structures: messages, ports, parameters

pub mod message;
pub mod parameter;
pub mod port;

pub use message::*;
pub use parameter::*;
pub use port::*;
