//! # Cascade - Distributed Dataflow Control Plane
//!
//! Cascade orchestrates a cluster of cooperating processes: one controller
//! plus dynamically spawned worker modules that agree on a shared dataflow
//! graph (ports, connections, parameters) and coordinate barrier and reduce
//! synchronization across ranks. All shared state is message-driven; every
//! mutation funnels through the module manager's dispatch path.

pub mod client;
pub mod control;
pub mod core;
pub mod transport;
pub mod util;

pub use self::control::manager::ModuleManager;
pub use self::core::message::{Envelope, Message, MessageId};

/// Initialize the Cascade system
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("initializing cascade v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Main error type for Cascade operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("message of {size} bytes exceeds maximum frame size of {max}")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no module with id {0}")]
    UnknownModule(i32),

    #[error("spawn rejected: {0}")]
    Spawn(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
