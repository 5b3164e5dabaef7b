//! Module availability registry and rank placement

use dashmap::DashMap;

use crate::transport::{MessageQueue, QueueReceiver};
use crate::{Error, Result};

/// Everything a freshly spawned worker needs to talk to its controller
pub struct WorkerContext {
    pub id: i32,
    pub name: String,
    pub ranks: Vec<i32>,
    /// controller -> module
    pub recv: QueueReceiver,
    /// module -> controller
    pub send: MessageQueue,
}

/// Launches one worker, typically by handing the context to a spawned task
pub type WorkerFactory = Box<dyn Fn(WorkerContext) + Send + Sync>;

/// Name -> factory catalog. Spawn requests for unknown names are rejected
/// here, before any queue or process resources exist.
#[derive(Default)]
pub struct ModuleLibrary {
    entries: DashMap<String, WorkerFactory>,
}

impl ModuleLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(WorkerContext) + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The process-group spawn primitive
    pub fn launch(&self, name: &str, ctx: WorkerContext) -> Result<()> {
        match self.entries.get(name) {
            Some(factory) => {
                factory(ctx);
                Ok(())
            }
            None => Err(Error::Spawn(format!("module {name} is not available"))),
        }
    }
}

/// Rank placement derived from `(base_rank, mpi_size, rank_skip)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub ranks: Vec<i32>,
}

impl Placement {
    /// Fails when the requested shape is degenerate or the derived ranks
    /// fall outside the fabric; nothing is allocated on failure
    pub fn resolve(base_rank: i32, mpi_size: i32, rank_skip: i32, fabric_size: i32) -> Result<Self> {
        if mpi_size <= 0 || base_rank < 0 || rank_skip < 0 {
            return Err(Error::Spawn(format!(
                "invalid placement: base_rank={base_rank} mpi_size={mpi_size} rank_skip={rank_skip}"
            )));
        }
        let ranks: Vec<i32> = (0..mpi_size)
            .map(|k| base_rank + k * (rank_skip + 1))
            .collect();
        if let Some(&last) = ranks.last() {
            if last >= fabric_size {
                return Err(Error::Spawn(format!(
                    "rank {last} outside fabric of size {fabric_size}"
                )));
            }
        }
        Ok(Self { ranks })
    }

    pub fn contains(&self, rank: i32) -> bool {
        self.ranks.contains(&rank)
    }
}
