//! Client manager: interactive command sessions feeding the dispatch path
//!
//! Console, socket and script-file sessions all parse the same line
//! protocol and funnel their messages through the shared manager lock, so
//! exactly one client mutates control state at a time.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::manager::ModuleManager;
use crate::core::message::{ComputeReason, Envelope, Message, BROADCAST, CONTROLLER};
use crate::core::parameter::ParameterValue;
use crate::Result;

/// The shared mutation entry point every client must go through
pub type SharedManager = Arc<Mutex<ModuleManager>>;

pub struct ClientManager {
    manager: SharedManager,
    cancel: CancellationToken,
}

impl ClientManager {
    pub fn new(manager: SharedManager, cancel: CancellationToken) -> Self {
        Self { manager, cancel }
    }

    /// Accept socket sessions, one handling task per connection
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening for client sessions");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "client connected");
                    let manager = self.manager.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_socket_session(stream, manager, cancel).await {
                            warn!(%peer, "client session ended: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Drive an interactive session over stdin
    pub async fn console(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { return Ok(()) };
            let reply = execute_line(&self.manager, line.trim()).await;
            if !reply.is_empty() {
                println!("{reply}");
            }
            if self.manager.lock().await.is_quitting() {
                return Ok(());
            }
        }
    }

    /// Execute a command script line by line; `#` starts a comment
    pub async fn run_script(&self, path: &Path) -> Result<()> {
        let script = tokio::fs::read_to_string(path).await?;
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let reply = execute_line(&self.manager, line).await;
            info!(command = line, "{reply}");
        }
        Ok(())
    }
}

async fn run_socket_session(
    stream: TcpStream,
    manager: SharedManager,
    cancel: CancellationToken,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    write_half.write_all(b"cascade control session\n").await?;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { return Ok(()) };
        let reply = execute_line(&manager, line.trim()).await;
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        if manager.lock().await.is_quitting() {
            return Ok(());
        }
    }
}

/// Parse and run one command line. The manager lock is held for the
/// duration of the command, except while blocking on a barrier.
pub async fn execute_line(manager: &SharedManager, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return String::new();
    };
    let args: Vec<&str> = parts.collect();

    match command {
        "spawn" => {
            let Some(name) = args.first() else {
                return "usage: spawn <module> [mpi_size] [rank_skip] [base_rank]".into();
            };
            let mpi_size = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
            let rank_skip = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let base_rank = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut mgr = manager.lock().await;
            match mgr.spawn_module(0, name, mpi_size, rank_skip, base_rank) {
                Ok(id) => format!("spawned {name} as module {id}"),
                Err(e) => format!("error: {e}"),
            }
        }
        "connect" | "disconnect" => {
            let parsed = (
                args.first().and_then(|s| s.parse::<i32>().ok()),
                args.get(1),
                args.get(2).and_then(|s| s.parse::<i32>().ok()),
                args.get(3),
            );
            let (Some(from_id), Some(from_port), Some(to_id), Some(to_port)) = parsed else {
                return format!("usage: {command} <id> <port> <id> <port>");
            };
            let payload = if command == "connect" {
                Message::Connect {
                    from_id,
                    from_port: from_port.to_string(),
                    to_id,
                    to_port: to_port.to_string(),
                }
            } else {
                Message::Disconnect {
                    from_id,
                    from_port: from_port.to_string(),
                    to_id,
                    to_port: to_port.to_string(),
                }
            };
            let mut mgr = manager.lock().await;
            match mgr.handle(Envelope::new(CONTROLLER, CONTROLLER, payload)) {
                Ok(()) => "ok".into(),
                Err(e) => format!("error: {e}"),
            }
        }
        "setparam" => {
            let parsed = (
                args.first().and_then(|s| s.parse::<i32>().ok()),
                args.get(1),
                args.get(2),
            );
            let (Some(module_id), Some(name), Some(raw)) = parsed else {
                return "usage: setparam <id> <name> <value>".into();
            };
            let value = parse_value(raw);
            let mut mgr = manager.lock().await;
            match mgr.handle(Envelope::new(
                CONTROLLER,
                module_id,
                Message::SetParameter {
                    sender_id: CONTROLLER,
                    module_id,
                    name: name.to_string(),
                    value,
                    reply: false,
                },
            )) {
                Ok(()) => "ok".into(),
                Err(e) => format!("error: {e}"),
            }
        }
        "compute" => {
            let module_id = match args.first() {
                Some(&"all") | None => BROADCAST,
                Some(raw) => match raw.parse() {
                    Ok(id) => id,
                    Err(_) => return "usage: compute [all|<id>]".into(),
                },
            };
            let mut mgr = manager.lock().await;
            match mgr.handle(Envelope::new(
                CONTROLLER,
                module_id,
                Message::Compute {
                    module_id,
                    execution_count: -1,
                    all_ranks: false,
                    reason: ComputeReason::Execute,
                },
            )) {
                Ok(()) => "ok".into(),
                Err(e) => format!("error: {e}"),
            }
        }
        "barrier" => {
            // issue under the lock, then wait for the release without it
            let (id, mut released) = {
                let mut mgr = manager.lock().await;
                let id = mgr.new_barrier_id();
                let released = mgr.barrier_watch();
                if let Err(e) = mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id })) {
                    return format!("error: {e}");
                }
                (id, released)
            };
            loop {
                if *released.borrow_and_update() >= id {
                    return format!("barrier {id} reached");
                }
                if released.changed().await.is_err() {
                    return "error: controller gone".into();
                }
            }
        }
        "kill" => {
            let Some(module_id) = args.first().and_then(|s| s.parse::<i32>().ok()) else {
                return "usage: kill <id>".into();
            };
            let mut mgr = manager.lock().await;
            match mgr.handle(Envelope::new(CONTROLLER, module_id, Message::Kill { module_id })) {
                Ok(()) => "ok".into(),
                Err(e) => format!("error: {e}"),
            }
        }
        "modules" => {
            let mgr = manager.lock().await;
            let mut out = String::new();
            for id in mgr.running_ids() {
                if let Some(view) = mgr.state().module(id) {
                    out.push_str(&format!(
                        "{id}: {} ({})\n",
                        view.name,
                        if view.busy { "busy" } else { "idle" }
                    ));
                }
            }
            if out.is_empty() {
                "no modules running".into()
            } else {
                out.trim_end().to_string()
            }
        }
        "available" => {
            let mgr = manager.lock().await;
            mgr.library().available().join(" ")
        }
        "quit" => {
            let mut mgr = manager.lock().await;
            match mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Quit)) {
                Ok(()) => "shutting down".into(),
                Err(e) => format!("error: {e}"),
            }
        }
        "help" => "commands: spawn connect disconnect setparam compute barrier kill modules available quit".into(),
        other => format!("unknown command {other}; try help"),
    }
}

/// Best-effort typed parse: int, then float, then bool, else string
fn parse_value(raw: &str) -> ParameterValue {
    if let Ok(i) = raw.parse::<i32>() {
        return ParameterValue::Int(i);
    }
    if let Ok(f) = raw.parse::<f32>() {
        return ParameterValue::Float(f);
    }
    match raw {
        "true" => ParameterValue::Bool(true),
        "false" => ParameterValue::Bool(false),
        _ => ParameterValue::String(raw.to_string()),
    }
}
