//! Cascade controller binary
//!
//! Builds the control plane — fabric, module library, manager, client
//! sessions — and runs the dispatch loop until a quit command arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cascade::client::ClientManager;
use cascade::control::library::ModuleLibrary;
use cascade::control::manager::{run_dispatch, ModuleManager};
use cascade::control::worker::{run_worker, Worker, WorkerDescription};
use cascade::core::message::ObjectHandle;
use cascade::core::parameter::ParameterValue;
use cascade::transport::LoopbackFabric;
use cascade::util::SystemConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cascade::init()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = SystemConfig::load().context("loading configuration")?;
    if args.iter().any(|a| a == "--print-config") {
        println!("{}", config.to_toml());
        return Ok(());
    }

    let fabric = LoopbackFabric::solo();
    let library = Arc::new(ModuleLibrary::new());
    register_builtin_modules(&library);
    info!("available modules: {}", library.available().join(" "));

    let manager = Arc::new(Mutex::new(
        ModuleManager::new(fabric, library).with_queue_capacity(config.queue_capacity),
    ));
    let cancel = CancellationToken::new();

    if let Some(pos) = args.iter().position(|a| a == "--script") {
        let path = args
            .get(pos + 1)
            .context("--script requires a file argument")?
            .clone();
        ClientManager::new(manager.clone(), cancel.clone())
            .run_script(std::path::Path::new(&path))
            .await
            .with_context(|| format!("running script {path}"))?;
    }

    {
        let listen = ClientManager::new(manager.clone(), cancel.clone());
        let addr = config.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = listen.listen(&addr).await {
                warn!("listener stopped: {e}");
            }
        });
    }
    if args.iter().any(|a| a == "--console") {
        let console = ClientManager::new(manager.clone(), cancel.clone());
        tokio::spawn(async move {
            if let Err(e) = console.console().await {
                warn!("console stopped: {e}");
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    run_dispatch(
        manager,
        cancel,
        Duration::from_millis(config.tick_interval_ms),
        config.shutdown_retries,
    )
    .await;
    info!("controller stopped");
    Ok(())
}

fn register_builtin_modules(library: &ModuleLibrary) {
    library.register("Generator", |ctx| {
        tokio::spawn(run_worker(Generator::default(), ctx));
    });
    library.register("IsoSurface", |ctx| {
        tokio::spawn(run_worker(IsoSurface::default(), ctx));
    });
    library.register("Show", |ctx| {
        tokio::spawn(run_worker(Show, ctx));
    });
}

/// Source module emitting one object handle per compute round
#[derive(Default)]
struct Generator {
    count: i32,
}

#[async_trait::async_trait]
impl Worker for Generator {
    fn describe(&self) -> WorkerDescription {
        WorkerDescription {
            output_ports: vec!["data_out".into()],
            parameters: vec![("count".into(), ParameterValue::Int(1))],
            ..Default::default()
        }
    }

    async fn compute(&mut self) -> cascade::Result<Vec<(String, ObjectHandle)>> {
        let rounds = self.count.max(1);
        Ok((0..rounds)
            .map(|_| ("data_out".to_string(), ObjectHandle::new()))
            .collect())
    }

    fn set_parameter(&mut self, name: &str, value: ParameterValue) -> ParameterValue {
        if name == "count" {
            if let ParameterValue::Int(v) = value {
                self.count = v;
                return ParameterValue::Int(v);
            }
        }
        value
    }
}

/// Filter module passing one derived object downstream
struct IsoSurface {
    isovalue: f32,
}

impl Default for IsoSurface {
    fn default() -> Self {
        Self { isovalue: 0.5 }
    }
}

#[async_trait::async_trait]
impl Worker for IsoSurface {
    fn describe(&self) -> WorkerDescription {
        WorkerDescription {
            input_ports: vec!["data_in".into()],
            output_ports: vec!["data_out".into()],
            parameters: vec![("isovalue".into(), ParameterValue::Float(self.isovalue))],
            ..Default::default()
        }
    }

    async fn compute(&mut self) -> cascade::Result<Vec<(String, ObjectHandle)>> {
        Ok(vec![("data_out".to_string(), ObjectHandle::new())])
    }

    fn set_parameter(&mut self, name: &str, value: ParameterValue) -> ParameterValue {
        if name == "isovalue" {
            if let ParameterValue::Float(v) = value {
                self.isovalue = v;
                return ParameterValue::Float(v);
            }
        }
        value
    }
}

/// Sink module consuming whatever arrives
struct Show;

#[async_trait::async_trait]
impl Worker for Show {
    fn describe(&self) -> WorkerDescription {
        WorkerDescription {
            input_ports: vec!["grid_in".into()],
            ..Default::default()
        }
    }

    async fn compute(&mut self) -> cascade::Result<Vec<(String, ObjectHandle)>> {
        Ok(Vec::new())
    }
}
