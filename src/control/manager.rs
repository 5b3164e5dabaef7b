//! Module manager: the authoritative control-plane orchestrator
//!
//! A message-driven state machine owning the running map of live modules,
//! the barrier/reduce coordination state and the pending-replay buffer.
//! Every mutation of shared control state funnels through [`ModuleManager::handle`];
//! the dispatch loop and interactive clients serialize on one lock around it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::control::library::{ModuleLibrary, Placement, WorkerContext};
use crate::control::state::StateTracker;
use crate::core::message::{
    self, ComputeReason, Envelope, ExecutionStage, Message, MessageId, ObjectHandle, ObjectPolicy,
    ReducePolicy, SchedulingPolicy, Severity, BROADCAST, CONTROLLER, FIRST_MODULE_ID,
};
use crate::core::port::{PortId, PortKind};
use crate::transport::{queue_pair, Fabric, MessageQueue, QueueReceiver, QUEUE_CAPACITY};
use crate::{Error, Result};

/// Capacity of the observer fan-out channel
const OBSERVER_CAPACITY: usize = 512;

/// Live module entry in the running map
pub struct ModuleHandle {
    pub id: i32,
    pub name: String,
    /// whether this control rank hosts one of the module's ranks
    pub local: bool,
    pub ranks: Vec<i32>,
    spawn_shape: (i32, i32, i32),
    send: MessageQueue,
    recv: QueueReceiver,
    pub scheduling: SchedulingPolicy,
    pub object_policy: ObjectPolicy,
    pub reduce_policy: ReducePolicy,
    ranks_started: i32,
    ranks_finished: i32,
    reducing: bool,
    exiting: bool,
}

pub struct ModuleManager {
    fabric: Arc<dyn Fabric>,
    library: Arc<ModuleLibrary>,
    state: StateTracker,
    running: HashMap<i32, ModuleHandle>,
    busy: HashSet<i32>,
    reached: HashSet<i32>,
    active_barrier: Option<u64>,
    barrier_counter: u64,
    barrier_released: watch::Sender<u64>,
    pending: VecDeque<Envelope>,
    observers: broadcast::Sender<Envelope>,
    next_module_id: i32,
    exec_count: i64,
    queue_capacity: usize,
    quitting: bool,
}

impl ModuleManager {
    pub fn new(fabric: Arc<dyn Fabric>, library: Arc<ModuleLibrary>) -> Self {
        let (barrier_released, _) = watch::channel(0);
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            fabric,
            library,
            state: StateTracker::new(),
            running: HashMap::new(),
            busy: HashSet::new(),
            reached: HashSet::new(),
            active_barrier: None,
            barrier_counter: 0,
            barrier_released,
            pending: VecDeque::new(),
            observers,
            next_module_id: FIRST_MODULE_ID,
            exec_count: 0,
            queue_capacity: QUEUE_CAPACITY,
            quitting: false,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Subscribe to the message stream fanned out to UIs and observers
    pub fn observe(&self) -> broadcast::Receiver<Envelope> {
        self.observers.subscribe()
    }

    /// Watch channel carrying the id of the last released barrier
    pub fn barrier_watch(&self) -> watch::Receiver<u64> {
        self.barrier_released.subscribe()
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    pub fn library(&self) -> &ModuleLibrary {
        &self.library
    }

    pub fn running_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self, id: i32) -> bool {
        self.running.contains_key(&id)
    }

    pub fn is_busy(&self, id: i32) -> bool {
        self.busy.contains(&id)
    }

    pub fn active_barrier(&self) -> Option<u64> {
        self.active_barrier
    }

    pub fn has_reached(&self, id: i32) -> bool {
        self.reached.contains(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn execution_count(&self) -> i64 {
        self.exec_count
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    /// Fresh barrier id for an interactive `barrier` request
    pub fn new_barrier_id(&mut self) -> u64 {
        self.barrier_counter += 1;
        self.barrier_counter
    }

    /// Fresh module id; monotonic while any module numbering is active
    fn new_module_id(&mut self) -> i32 {
        let id = self.next_module_id;
        self.next_module_id += 1;
        id
    }

    /// Apply one control message: the single mutation entry point
    pub fn handle(&mut self, env: Envelope) -> Result<()> {
        self.dispatch(env, false)
    }

    /// Spawn on behalf of a client; returns the assigned module id
    pub fn spawn_module(
        &mut self,
        requested_id: i32,
        name: &str,
        mpi_size: i32,
        rank_skip: i32,
        base_rank: i32,
    ) -> Result<i32> {
        self.spawn_inner(requested_id, name, mpi_size, rank_skip, base_rank, false)
    }

    /// One scheduling tick: poll the collective fabric for one pending
    /// message, then drain each local module queue in round-robin bursts
    pub fn tick(&mut self) {
        match self.fabric.poll() {
            Ok(Some(frame)) => match message::decode(&frame) {
                Ok(env) => {
                    if let Err(e) = self.dispatch(env, true) {
                        warn!("fabric message handler failed: {e}");
                    }
                }
                Err(e) => error!("undecodable fabric frame dropped: {e}"),
            },
            Ok(None) => {}
            Err(e) => error!("fabric poll failed: {e}"),
        }

        for id in self.running_ids() {
            loop {
                let polled = match self.running.get_mut(&id) {
                    Some(h) if h.local && !h.exiting => h.recv.try_receive(),
                    _ => break,
                };
                match polled {
                    Ok(Some(env)) => {
                        if let Err(e) = self.dispatch(env, false) {
                            warn!(module = id, "handler failed: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // a dead transport means a dead module
                        error!(module = id, "receive failed ({e}), synthesizing exit");
                        let exit = Envelope::new(
                            id,
                            CONTROLLER,
                            Message::ModuleExit {
                                module_id: id,
                                forwarded: false,
                            },
                        );
                        if let Err(e) = self.dispatch(exit, false) {
                            warn!(module = id, "synthesized exit failed: {e}");
                        }
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, env: Envelope, from_fabric: bool) -> Result<()> {
        trace!(sender = env.sender, dest = env.dest, "dispatching {:?}", env.payload);
        match env.payload.clone() {
            Message::Spawn {
                requested_id,
                name,
                mpi_size,
                rank_skip,
                base_rank,
            } => {
                // failures are surfaced as text messages, never escalated
                let _ = self.spawn_inner(requested_id, &name, mpi_size, rank_skip, base_rank, from_fabric);
                Ok(())
            }
            Message::Started { .. } | Message::CreateInputPort { .. } | Message::CreateOutputPort { .. } => {
                self.state.handle(&env);
                self.emit(env);
                self.replay_pending();
                Ok(())
            }
            Message::ModuleExit {
                module_id,
                forwarded,
            } => self.on_module_exit(env, module_id, forwarded),
            Message::Connect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => self.on_connect(env, from_id, from_port, to_id, to_port),
            Message::Disconnect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => self.on_disconnect(env, from_id, from_port, to_id, to_port),
            Message::Compute {
                module_id,
                execution_count,
                all_ranks,
                reason,
            } => self.on_compute(env, module_id, execution_count, all_ranks, reason, from_fabric),
            Message::Reduce { module_id, .. } => self.forward_to(module_id, env),
            Message::ExecutionProgress { module_id, stage } => {
                self.on_execution_progress(env, module_id, stage)
            }
            Message::Busy { module_id } => {
                if !self.busy.insert(module_id) {
                    warn!(module = module_id, "Busy from already-busy module");
                }
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::Idle { module_id } => {
                if !self.busy.remove(&module_id) {
                    warn!(module = module_id, "Idle without preceding Busy");
                }
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::AddObject {
                sender_id,
                port_name,
                object,
            } => self.on_add_object(sender_id, &port_name, object),
            Message::ObjectReceived { .. } => {
                if env.dest >= FIRST_MODULE_ID {
                    let dest = env.dest;
                    self.forward_to(dest, env)?;
                }
                Ok(())
            }
            Message::AddParameter { module_id, .. } => self.on_add_parameter(env, module_id),
            Message::SetParameter {
                sender_id,
                module_id,
                name,
                value,
                reply,
            } => self.on_set_parameter(env, sender_id, module_id, name, value, reply),
            Message::SetParameterChoices { .. } => {
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::SchedulingPolicy { module_id, policy } => {
                if let Some(h) = self.running.get_mut(&module_id) {
                    h.scheduling = policy;
                }
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::ObjectReceivePolicy { module_id, policy } => {
                if let Some(h) = self.running.get_mut(&module_id) {
                    h.object_policy = policy;
                }
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::ReducePolicy { module_id, policy } => {
                if let Some(h) = self.running.get_mut(&module_id) {
                    h.reduce_policy = policy;
                }
                self.state.handle(&env);
                self.emit(env);
                Ok(())
            }
            Message::Kill { module_id } => self.forward_to(module_id, env),
            Message::Barrier { id } => self.on_barrier(env, id),
            Message::BarrierReached { id, module_id } => self.on_barrier_reached(id, module_id),
            Message::Ping { .. } => {
                for id in self.running_ids() {
                    self.forward_to(id, env.clone())?;
                }
                Ok(())
            }
            Message::Pong { .. } => {
                self.emit(env);
                Ok(())
            }
            Message::ResetModuleIds => {
                self.on_reset_module_ids();
                Ok(())
            }
            Message::Text { severity, text } => {
                match severity {
                    Severity::Info => info!("{text}"),
                    Severity::Warning => warn!("{text}"),
                    Severity::Error => error!("{text}"),
                }
                self.emit(env);
                Ok(())
            }
            Message::Quit => self.on_quit(from_fabric),
        }
    }

    fn spawn_inner(
        &mut self,
        requested_id: i32,
        name: &str,
        mpi_size: i32,
        rank_skip: i32,
        base_rank: i32,
        from_fabric: bool,
    ) -> Result<i32> {
        if self.quitting {
            return Err(Error::Spawn("controller is shutting down".into()));
        }
        if !self.library.contains(name) {
            self.report(Severity::Error, format!("cannot spawn unknown module {name}"));
            return Err(Error::Spawn(format!("unknown module name {name}")));
        }
        let placement = match Placement::resolve(base_rank, mpi_size, rank_skip, self.fabric.size()) {
            Ok(p) => p,
            Err(e) => {
                self.report(Severity::Error, format!("spawn of {name} rejected: {e}"));
                return Err(e);
            }
        };

        let id = if requested_id >= FIRST_MODULE_ID {
            requested_id
        } else {
            self.new_module_id()
        };
        if self.running.contains_key(&id) {
            // our own resolved broadcast coming back through the fabric
            debug!(module = id, "spawn for known id ignored");
            return Ok(id);
        }
        if requested_id >= self.next_module_id {
            self.next_module_id = requested_id + 1;
        }

        let local = placement.contains(self.fabric.rank());
        let (ctrl_send, worker_recv) = queue_pair(&format!("{name}_{id}_recv"), self.queue_capacity);
        let (worker_send, ctrl_recv) = queue_pair(&format!("{name}_{id}_send"), self.queue_capacity);

        // the running map entry exists before the process does
        self.running.insert(
            id,
            ModuleHandle {
                id,
                name: name.to_string(),
                local,
                ranks: placement.ranks.clone(),
                spawn_shape: (mpi_size, rank_skip, base_rank),
                send: ctrl_send,
                recv: ctrl_recv,
                scheduling: SchedulingPolicy::Single,
                object_policy: ObjectPolicy::Local,
                reduce_policy: ReducePolicy::Never,
                ranks_started: 0,
                ranks_finished: 0,
                reducing: false,
                exiting: false,
            },
        );

        if local {
            let ctx = WorkerContext {
                id,
                name: name.to_string(),
                ranks: placement.ranks,
                recv: worker_recv,
                send: worker_send,
            };
            if let Err(e) = self.library.launch(name, ctx) {
                // roll back; a failed spawn leaves no partial state behind
                self.running.remove(&id);
                self.report(Severity::Error, format!("spawn of {name} failed: {e}"));
                return Err(e);
            }
        }

        let resolved = Envelope::new(
            CONTROLLER,
            BROADCAST,
            Message::Spawn {
                requested_id: id,
                name: name.to_string(),
                mpi_size,
                rank_skip,
                base_rank,
            },
        );
        self.state.handle(&resolved);
        if !from_fabric && self.fabric.size() > 1 {
            self.broadcast(&resolved)?;
        }
        self.emit(resolved);
        self.replay_history_to(id);
        info!(module = id, name, local, "module spawned");
        Ok(id)
    }

    /// Bring a newcomer up to date: replay the spawn, parameter
    /// registration and current value of every already-running module, so
    /// global state reconstructs without a central catalog
    fn replay_history_to(&self, new_id: i32) {
        let Some(target) = self.running.get(&new_id) else {
            return;
        };
        if !target.local {
            return;
        }
        let mut peers: Vec<&ModuleHandle> = self
            .running
            .values()
            .filter(|h| h.id != new_id)
            .collect();
        peers.sort_by_key(|h| h.id);
        for peer in peers {
            let (mpi_size, rank_skip, base_rank) = peer.spawn_shape;
            let mut messages = vec![Message::Spawn {
                requested_id: peer.id,
                name: peer.name.clone(),
                mpi_size,
                rank_skip,
                base_rank,
            }];
            for param in self.state.parameters().module_parameters(peer.id) {
                messages.push(Message::AddParameter {
                    module_id: peer.id,
                    name: param.name.clone(),
                    value: param.value.clone(),
                });
                messages.push(Message::SetParameter {
                    sender_id: peer.id,
                    module_id: peer.id,
                    name: param.name.clone(),
                    value: param.value.clone(),
                    reply: true,
                });
            }
            for payload in messages {
                if let Err(e) = target.send.try_send(Envelope::new(CONTROLLER, new_id, payload)) {
                    warn!(module = new_id, "state replay send failed: {e}");
                    return;
                }
            }
        }
    }

    fn on_module_exit(&mut self, env: Envelope, module_id: i32, forwarded: bool) -> Result<()> {
        if !forwarded {
            // phase 1, on the launch rank only: broadcast a forwarded copy
            // so every replica tears down identically
            let Some(h) = self.running.get_mut(&module_id) else {
                debug!(module = module_id, "exit notice for unknown module");
                return Ok(());
            };
            if h.exiting {
                return Ok(());
            }
            if !h.local {
                debug!(module = module_id, "ignoring unforwarded exit for remote module");
                return Ok(());
            }
            h.exiting = true;
            let fwd = Envelope::correlated(
                env.id,
                env.sender,
                BROADCAST,
                Message::ModuleExit {
                    module_id,
                    forwarded: true,
                },
            );
            return self.broadcast(&fwd);
        }

        // phase 2, on every replica
        if !self.running.contains_key(&module_id) {
            debug!(module = module_id, "exit already processed");
            return Ok(());
        }
        for peer in self.running_ids() {
            if peer != module_id {
                let notice = Envelope::correlated(env.id, module_id, peer, env.payload.clone());
                self.forward_to(peer, notice)?;
            }
        }
        self.state.handle(&env);
        self.running.remove(&module_id);
        self.busy.remove(&module_id);
        self.reached.remove(&module_id);
        self.pending.retain(|p| !mentions_module(p, module_id));
        self.emit(env);
        self.check_barrier_release();
        info!(module = module_id, "module exited");
        Ok(())
    }

    fn on_connect(
        &mut self,
        env: Envelope,
        from_id: i32,
        from_port: String,
        to_id: i32,
        to_port: String,
    ) -> Result<()> {
        let have_both = self.state.ports().port(from_id, &from_port).is_some()
            && self.state.ports().port(to_id, &to_port).is_some();
        if !have_both {
            debug!(
                from = from_id,
                to = to_id,
                "buffering connect until both ports exist"
            );
            self.pending.push_back(env);
            return Ok(());
        }
        if self.state.handle(&env) {
            self.forward_to(from_id, env.clone())?;
            self.forward_to(to_id, env.clone())?;
            self.emit(env);
        } else {
            self.report(
                Severity::Warning,
                format!("connect {from_id}:{from_port} -> {to_id}:{to_port} rejected"),
            );
        }
        Ok(())
    }

    fn on_disconnect(
        &mut self,
        env: Envelope,
        from_id: i32,
        from_port: String,
        to_id: i32,
        to_port: String,
    ) -> Result<()> {
        if self.state.handle(&env) {
            self.forward_to(from_id, env.clone())?;
            self.forward_to(to_id, env.clone())?;
            self.emit(env);
            return Ok(());
        }
        // the connection may still materialize from a buffered connect;
        // defer exactly when such a connect is pending
        if self.pending_connect_matches(from_id, &from_port, to_id, &to_port) {
            debug!(from = from_id, to = to_id, "deferring disconnect behind pending connect");
            self.pending.push_back(env);
        } else {
            debug!(from = from_id, to = to_id, "disconnect of unknown connection ignored");
        }
        Ok(())
    }

    fn on_compute(
        &mut self,
        env: Envelope,
        module_id: i32,
        execution_count: i64,
        all_ranks: bool,
        reason: ComputeReason,
        from_fabric: bool,
    ) -> Result<()> {
        if module_id == BROADCAST {
            // re-target to every source of the dataflow graph
            let count = self.resolve_exec_count(-1);
            for id in self.source_modules() {
                let msg = Envelope::correlated(
                    env.id,
                    env.sender,
                    id,
                    Message::Compute {
                        module_id: id,
                        execution_count: count,
                        all_ranks,
                        reason,
                    },
                );
                self.forward_to(id, msg)?;
            }
            return Ok(());
        }
        let count = self.resolve_exec_count(execution_count);
        let msg = Envelope::correlated(
            env.id,
            env.sender,
            module_id,
            Message::Compute {
                module_id,
                execution_count: count,
                all_ranks,
                reason,
            },
        );
        if all_ranks && !from_fabric && self.fabric.size() > 1 {
            self.broadcast(&msg)
        } else {
            self.forward_to(module_id, msg)
        }
    }

    /// Monotonic execution counter: a fresh count for negative requests,
    /// otherwise the global counter is raised to match
    fn resolve_exec_count(&mut self, count: i64) -> i64 {
        if count < 0 {
            self.exec_count += 1;
            self.exec_count
        } else {
            if count > self.exec_count {
                self.exec_count = count;
            }
            count
        }
    }

    /// Modules with no connected input port
    fn source_modules(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .running
            .keys()
            .copied()
            .filter(|id| {
                self.state
                    .ports()
                    .module_ports(*id, PortKind::Input)
                    .iter()
                    .all(|p| {
                        self.state
                            .ports()
                            .connection_list(&p.id)
                            .map_or(true, |l| l.is_empty())
                    })
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    fn on_execution_progress(
        &mut self,
        env: Envelope,
        module_id: i32,
        stage: ExecutionStage,
    ) -> Result<()> {
        if self.fabric.rank() != 0 {
            // only rank 0 accumulates progress
            self.emit(env);
            return Ok(());
        }
        let mut finish_round = false;
        let mut start_reduce = false;
        {
            let Some(h) = self.running.get_mut(&module_id) else {
                self.report_unknown(module_id);
                return Ok(());
            };
            match stage {
                ExecutionStage::Start => h.ranks_started += 1,
                ExecutionStage::Iteration | ExecutionStage::Timestep => {}
                ExecutionStage::Finish => {
                    h.ranks_finished += 1;
                    if h.ranks_finished >= h.ranks.len() as i32 {
                        h.ranks_started = 0;
                        h.ranks_finished = 0;
                        if h.reducing {
                            // the deferred finish flows downstream now
                            h.reducing = false;
                            finish_round = true;
                        } else if h.reduce_policy == ReducePolicy::OverAll {
                            h.reducing = true;
                            start_reduce = true;
                        } else {
                            finish_round = true;
                        }
                    }
                }
            }
        }
        if start_reduce {
            let reduce = Envelope::new(
                CONTROLLER,
                module_id,
                Message::Reduce {
                    module_id,
                    timestep: -1,
                },
            );
            // every rank of the module must take part in the reduction
            if self.fabric.size() > 1 {
                self.broadcast(&reduce)?;
            } else {
                self.forward_to(module_id, reduce)?;
            }
        }
        if finish_round {
            self.forward_finish_downstream(module_id, env.id)?;
        }
        self.emit(env);
        Ok(())
    }

    /// Forward a finished execution to every directly connected downstream
    /// module exactly once, even when reached via multiple output ports
    fn forward_finish_downstream(&self, module_id: i32, correlation: MessageId) -> Result<()> {
        let mut dests: HashSet<i32> = HashSet::new();
        for port in self.state.ports().module_ports(module_id, PortKind::Output) {
            if let Some(list) = self.state.ports().connection_list(&port.id) {
                for peer in list {
                    dests.insert(peer.module);
                }
            }
        }
        let mut dests: Vec<i32> = dests.into_iter().collect();
        dests.sort_unstable();
        for dest in dests {
            let msg = Envelope::correlated(
                correlation,
                module_id,
                dest,
                Message::ExecutionProgress {
                    module_id,
                    stage: ExecutionStage::Finish,
                },
            );
            self.forward_to(dest, msg)?;
        }
        Ok(())
    }

    fn on_add_object(&mut self, sender_id: i32, port_name: &str, object: ObjectHandle) -> Result<()> {
        let out = match self.state.ports().port(sender_id, port_name) {
            Some(p) if p.kind == PortKind::Output => p.id.clone(),
            _ => {
                self.report(
                    Severity::Warning,
                    format!("object on unknown output port {sender_id}:{port_name} dropped"),
                );
                return Ok(());
            }
        };
        let destinations: Vec<PortId> = self
            .state
            .ports()
            .connection_list(&out)
            .map(|l| l.to_vec())
            .unwrap_or_default();
        for dest_port in destinations {
            let dest = dest_port.module;
            let Some((scheduling, object_policy)) = self
                .running
                .get(&dest)
                .map(|h| (h.scheduling, h.object_policy))
            else {
                self.report_unknown(dest);
                continue;
            };
            self.forward_to(
                dest,
                Envelope::new(
                    sender_id,
                    dest,
                    Message::AddObject {
                        sender_id,
                        port_name: dest_port.name.clone(),
                        object,
                    },
                ),
            )?;
            let count = self.resolve_exec_count(-1);
            let all_ranks = scheduling != SchedulingPolicy::Single;
            let compute = Envelope::new(
                CONTROLLER,
                dest,
                Message::Compute {
                    module_id: dest,
                    execution_count: count,
                    all_ranks,
                    reason: ComputeReason::AddedObject,
                },
            );
            if all_ranks && self.fabric.size() > 1 {
                self.broadcast(&compute)?;
            } else {
                self.forward_to(dest, compute)?;
            }
            if object_policy == ObjectPolicy::NotifyAll {
                let notice = Envelope::new(
                    sender_id,
                    dest,
                    Message::ObjectReceived {
                        sender_id,
                        port_name: dest_port.name.clone(),
                        object,
                    },
                );
                if self.fabric.size() > 1 {
                    self.broadcast(&notice)?;
                } else {
                    self.forward_to(dest, notice)?;
                }
            }
        }
        Ok(())
    }

    fn on_add_parameter(&mut self, env: Envelope, module_id: i32) -> Result<()> {
        if self.state.handle(&env) {
            for peer in self.running_ids() {
                if peer != module_id {
                    self.forward_to(peer, env.clone())?;
                }
            }
        }
        self.emit(env);
        self.replay_pending();
        Ok(())
    }

    fn on_set_parameter(
        &mut self,
        env: Envelope,
        sender_id: i32,
        module_id: i32,
        name: String,
        value: crate::core::parameter::ParameterValue,
        reply: bool,
    ) -> Result<()> {
        let is_owner = reply || sender_id == module_id;
        if !is_owner {
            // forward the request to the owning module, queueing it until
            // the owner and parameter are known
            let known = self.running.contains_key(&module_id)
                && self.state.parameter(module_id, &name).is_some();
            if known {
                self.forward_to(module_id, env)?;
            } else {
                debug!(module = module_id, name = %name, "queueing parameter request");
                self.pending.push_back(env);
            }
            return Ok(());
        }

        let Some(canonical) = self.state.parameter(module_id, &name) else {
            debug!(module = module_id, name = %name, "queueing ack until parameter registration");
            self.pending.push_back(env);
            return Ok(());
        };
        // a throwaway clone, diffed and discarded; never the canonical copy
        let mut probe = canonical.clone();
        probe.value = value.clone();
        let changed = probe.value != canonical.value;
        self.state.handle(&env);
        for peer in self.running_ids() {
            if peer != module_id {
                self.forward_to(peer, env.clone())?;
            }
        }
        self.emit(env.clone());
        if changed {
            self.propagate_linked(env.id, module_id, &name, &value)?;
        }
        Ok(())
    }

    /// Push a confirmed value to every parameter reachable through the
    /// port-connection graph, visiting each one at most once even under
    /// cycles; fan-out copies carry the original correlation id
    fn propagate_linked(
        &self,
        correlation: MessageId,
        module_id: i32,
        name: &str,
        value: &crate::core::parameter::ParameterValue,
    ) -> Result<()> {
        let start = PortId::new(module_id, name);
        let mut visited: HashSet<PortId> = HashSet::new();
        visited.insert(start.clone());
        let mut queue: VecDeque<PortId> = VecDeque::from([start]);
        let mut targets: Vec<PortId> = Vec::new();
        while let Some(port) = queue.pop_front() {
            let peers: Vec<PortId> = self
                .state
                .ports()
                .connection_list(&port)
                .map(|l| l.to_vec())
                .unwrap_or_default();
            for peer in peers {
                if visited.insert(peer.clone()) {
                    if self.state.parameter(peer.module, &peer.name).is_some() {
                        targets.push(peer.clone());
                    }
                    queue.push_back(peer);
                }
            }
        }
        for target in targets {
            let msg = Envelope::correlated(
                correlation,
                CONTROLLER,
                target.module,
                Message::SetParameter {
                    sender_id: CONTROLLER,
                    module_id: target.module,
                    name: target.name.clone(),
                    value: value.clone(),
                    reply: false,
                },
            );
            self.forward_to(target.module, msg)?;
        }
        Ok(())
    }

    fn on_barrier(&mut self, env: Envelope, id: u64) -> Result<()> {
        if let Some(active) = self.active_barrier {
            self.report(
                Severity::Warning,
                format!("barrier {id} requested while barrier {active} is still pending"),
            );
            return Err(Error::Protocol(format!("barrier {active} already active")));
        }
        self.active_barrier = Some(id);
        self.reached.clear();
        for module in self.running_ids() {
            self.forward_to(module, env.clone())?;
        }
        debug!(barrier = id, "barrier pending");
        // no running modules: satisfied immediately
        self.check_barrier_release();
        Ok(())
    }

    fn on_barrier_reached(&mut self, id: u64, module_id: i32) -> Result<()> {
        match self.active_barrier {
            Some(active) if active == id => {
                self.reached.insert(module_id);
                self.check_barrier_release();
            }
            _ => warn!(barrier = id, module = module_id, "stray BarrierReached"),
        }
        Ok(())
    }

    /// Release happens exactly when the reached set covers every running
    /// module
    fn check_barrier_release(&mut self) {
        let Some(id) = self.active_barrier else {
            return;
        };
        if !self.running.keys().all(|m| self.reached.contains(m)) {
            return;
        }
        self.active_barrier = None;
        self.reached.clear();
        self.emit(Envelope::new(
            CONTROLLER,
            BROADCAST,
            Message::BarrierReached {
                id,
                module_id: CONTROLLER,
            },
        ));
        self.barrier_released.send_replace(id);
        info!(barrier = id, "barrier released");
    }

    fn on_reset_module_ids(&mut self) {
        if self.running.is_empty() {
            self.next_module_id = FIRST_MODULE_ID;
            info!("module id counter reset");
        } else {
            // never queued across the reset; concurrent spawns keep their ids
            self.report(
                Severity::Warning,
                "module id reset rejected while modules are running".to_string(),
            );
        }
    }

    fn on_quit(&mut self, from_fabric: bool) -> Result<()> {
        if self.quitting {
            return Ok(());
        }
        self.quitting = true;
        if !from_fabric && self.fabric.size() > 1 {
            self.broadcast(&Envelope::new(CONTROLLER, BROADCAST, Message::Quit))?;
        }
        for module in self.running_ids() {
            self.forward_to(module, Envelope::new(CONTROLLER, module, Message::Quit))?;
        }
        info!("shutdown initiated");
        Ok(())
    }

    /// Replay buffered messages in FIFO order; entries that still cannot
    /// be applied re-queue themselves
    fn replay_pending(&mut self) {
        let drained: Vec<Envelope> = self.pending.drain(..).collect();
        for env in drained {
            if let Err(e) = self.dispatch(env, false) {
                warn!("replayed message failed: {e}");
            }
        }
    }

    fn pending_connect_matches(
        &self,
        from_id: i32,
        from_port: &str,
        to_id: i32,
        to_port: &str,
    ) -> bool {
        self.pending.iter().any(|env| {
            matches!(&env.payload, Message::Connect {
                from_id: f,
                from_port: fp,
                to_id: t,
                to_port: tp,
            } if *f == from_id && fp == from_port && *t == to_id && tp == to_port)
        })
    }

    /// Queue delivery to one module; unknown destinations are reported and
    /// the message dropped, oversized frames are surfaced to the caller
    fn forward_to(&self, id: i32, env: Envelope) -> Result<()> {
        let Some(h) = self.running.get(&id) else {
            debug!(module = id, "dropping message for unknown module");
            self.report(
                Severity::Warning,
                format!("message for unknown module {id} dropped"),
            );
            return Ok(());
        };
        if !h.local || h.exiting {
            trace!(module = id, "skipping delivery to non-local or exiting module");
            return Ok(());
        }
        match h.send.try_send(env) {
            Ok(()) => Ok(()),
            Err(e @ Error::FrameTooLarge { .. }) => Err(e),
            Err(Error::QueueFull(q)) => {
                warn!(module = id, queue = %q, "queue full, message dropped");
                Ok(())
            }
            Err(e) => {
                warn!(module = id, "send failed: {e}");
                Ok(())
            }
        }
    }

    fn broadcast(&self, env: &Envelope) -> Result<()> {
        let frame = message::encode(env)?;
        self.fabric.broadcast(&frame)
    }

    fn emit(&self, env: Envelope) {
        let _ = self.observers.send(env);
    }

    /// User-visible failure surface: a text message to UI/console clients
    fn report(&self, severity: Severity, text: String) {
        match severity {
            Severity::Info => info!("{text}"),
            Severity::Warning => warn!("{text}"),
            Severity::Error => error!("{text}"),
        }
        self.emit(Envelope::new(
            CONTROLLER,
            BROADCAST,
            Message::Text { severity, text },
        ));
    }

    fn report_unknown(&self, id: i32) {
        self.report(
            Severity::Warning,
            format!("message for unknown module {id} dropped"),
        );
    }
}

/// Whether a buffered message belongs to a module's pending state
fn mentions_module(env: &Envelope, id: i32) -> bool {
    match &env.payload {
        Message::Connect { from_id, to_id, .. } | Message::Disconnect { from_id, to_id, .. } => {
            *from_id == id || *to_id == id
        }
        Message::SetParameter {
            sender_id,
            module_id,
            ..
        } => *sender_id == id || *module_id == id,
        Message::AddParameter { module_id, .. } => *module_id == id,
        _ => false,
    }
}

/// Drive the manager's dispatch loop until a quit message or cancellation,
/// then drain remaining modules within a bounded retry budget
pub async fn run_dispatch(
    manager: Arc<Mutex<ModuleManager>>,
    cancel: CancellationToken,
    tick_interval: Duration,
    shutdown_retries: u32,
) {
    loop {
        {
            let mut mgr = manager.lock().await;
            mgr.tick();
            if mgr.is_quitting() {
                break;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                let mut mgr = manager.lock().await;
                if let Err(e) = mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Quit)) {
                    warn!("quit failed: {e}");
                }
                break;
            }
            _ = tokio::time::sleep(tick_interval) => {}
        }
    }

    for _ in 0..shutdown_retries {
        {
            let mut mgr = manager.lock().await;
            mgr.tick();
            if mgr.running_ids().is_empty() {
                info!("all modules exited");
                return;
            }
        }
        tokio::time::sleep(tick_interval).await;
    }
    let remaining = manager.lock().await.running_ids();
    warn!("modules still running after shutdown budget: {remaining:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlainMutex;

    use crate::core::parameter::ParameterValue;
    use crate::transport::LoopbackFabric;

    type Captured = Arc<PlainMutex<HashMap<i32, WorkerContext>>>;

    /// Library whose factories capture the worker contexts instead of
    /// spawning tasks, so tests can inspect module queues directly
    fn harness_on(fabric: Arc<LoopbackFabric>) -> (ModuleManager, Captured) {
        let library = Arc::new(ModuleLibrary::new());
        let captured: Captured = Arc::new(PlainMutex::new(HashMap::new()));
        for name in ["Generator", "IsoSurface", "Show"] {
            let slot = captured.clone();
            library.register(name, move |ctx| {
                slot.lock().insert(ctx.id, ctx);
            });
        }
        (ModuleManager::new(fabric, library), captured)
    }

    fn harness() -> (ModuleManager, Captured) {
        harness_on(LoopbackFabric::solo())
    }

    fn drain(captured: &Captured, id: i32) -> Vec<Envelope> {
        let mut out = Vec::new();
        if let Some(ctx) = captured.lock().get_mut(&id) {
            while let Ok(Some(env)) = ctx.recv.try_receive() {
                out.push(env);
            }
        }
        out
    }

    fn drain_all(captured: &Captured, ids: &[i32]) {
        for id in ids {
            drain(captured, *id);
        }
    }

    fn from_module(mgr: &mut ModuleManager, id: i32, payload: Message) {
        mgr.handle(Envelope::new(id, CONTROLLER, payload)).unwrap();
    }

    fn output_port(mgr: &mut ModuleManager, id: i32, name: &str) {
        from_module(
            mgr,
            id,
            Message::CreateOutputPort {
                module_id: id,
                name: name.to_string(),
            },
        );
    }

    fn input_port(mgr: &mut ModuleManager, id: i32, name: &str) {
        from_module(
            mgr,
            id,
            Message::CreateInputPort {
                module_id: id,
                name: name.to_string(),
            },
        );
    }

    fn connect(mgr: &mut ModuleManager, from: (i32, &str), to: (i32, &str)) {
        mgr.handle(Envelope::new(
            CONTROLLER,
            CONTROLLER,
            Message::Connect {
                from_id: from.0,
                from_port: from.1.to_string(),
                to_id: to.0,
                to_port: to.1.to_string(),
            },
        ))
        .unwrap();
    }

    fn finish(mgr: &mut ModuleManager, id: i32) {
        from_module(
            mgr,
            id,
            Message::ExecutionProgress {
                module_id: id,
                stage: ExecutionStage::Finish,
            },
        );
    }

    #[test]
    fn spawn_assigns_monotonic_ids_and_rejects_unknown_names() {
        let (mut mgr, captured) = harness();
        assert_eq!(mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap(), 1);
        assert_eq!(mgr.spawn_module(0, "Show", 1, 0, 0).unwrap(), 2);
        assert!(mgr.spawn_module(0, "Typo", 1, 0, 0).is_err());
        assert_eq!(mgr.running_ids(), vec![1, 2]);
        assert!(captured.lock().contains_key(&1));

        // reset is only permitted while nothing is running
        mgr.handle(Envelope::new(CONTROLLER, CONTROLLER, Message::ResetModuleIds))
            .unwrap();
        assert_eq!(mgr.spawn_module(0, "Generator", 1, 0, 0).unwrap(), 3);
    }

    #[test]
    fn reset_module_ids_after_all_exits() {
        let (mut mgr, _captured) = harness();
        assert_eq!(mgr.spawn_module(0, "Show", 1, 0, 0).unwrap(), 1);
        from_module(
            &mut mgr,
            1,
            Message::ModuleExit {
                module_id: 1,
                forwarded: false,
            },
        );
        mgr.tick(); // forwarded copy arrives through the fabric
        assert!(mgr.running_ids().is_empty());
        mgr.handle(Envelope::new(CONTROLLER, CONTROLLER, Message::ResetModuleIds))
            .unwrap();
        assert_eq!(mgr.spawn_module(0, "Show", 1, 0, 0).unwrap(), 1);
    }

    #[test]
    fn invalid_placement_leaves_no_state_behind() {
        let (mut mgr, captured) = harness();
        assert!(mgr.spawn_module(0, "Show", 4, 0, 0).is_err());
        assert!(mgr.running_ids().is_empty());
        assert!(captured.lock().is_empty());
    }

    #[test]
    fn buffered_connect_replays_once_the_port_exists() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        input_port(&mut mgr, 1, "data_in");
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        input_port(&mut mgr, 2, "grid_in");

        connect(&mut mgr, (1, "data_out"), (2, "grid_in"));
        assert_eq!(mgr.pending_len(), 1);
        assert!(mgr.state().ports().port(1, "data_out").is_none());
        drain_all(&captured, &[1, 2]);

        output_port(&mut mgr, 1, "data_out");
        assert_eq!(mgr.pending_len(), 0);
        let out = PortId::new(1, "data_out");
        let inp = PortId::new(2, "grid_in");
        assert!(mgr
            .state()
            .ports()
            .connection_list(&out)
            .unwrap()
            .contains(&inp));
        // both endpoint modules hear about the established connection
        for id in [1, 2] {
            assert!(drain(&captured, id)
                .iter()
                .any(|e| matches!(e.payload, Message::Connect { .. })));
        }
    }

    #[test]
    fn barrier_release_after_all_modules_reach() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        let mut observer = mgr.observe();

        mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id: 7 }))
            .unwrap();
        assert_eq!(mgr.active_barrier(), Some(7));
        for id in [1, 2] {
            assert!(drain(&captured, id)
                .iter()
                .any(|e| matches!(e.payload, Message::Barrier { id: 7 })));
        }

        from_module(&mut mgr, 1, Message::BarrierReached { id: 7, module_id: 1 });
        assert_eq!(mgr.active_barrier(), Some(7));
        assert!(mgr.has_reached(1));

        from_module(&mut mgr, 2, Message::BarrierReached { id: 7, module_id: 2 });
        assert_eq!(mgr.active_barrier(), None);
        assert!(!mgr.has_reached(1));
        assert_eq!(*mgr.barrier_watch().borrow(), 7);

        let mut releases = 0;
        while let Ok(env) = observer.try_recv() {
            if matches!(env.payload, Message::BarrierReached { id: 7, .. }) {
                releases += 1;
            }
        }
        assert_eq!(releases, 1);
    }

    #[test]
    fn at_most_one_active_barrier() {
        let (mut mgr, _captured) = harness();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id: 1 }))
            .unwrap();
        let second = mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id: 2 }));
        assert!(matches!(second, Err(Error::Protocol(_))));
        assert_eq!(mgr.active_barrier(), Some(1));
    }

    #[test]
    fn barrier_without_modules_is_satisfied_immediately() {
        let (mut mgr, _captured) = harness();
        mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id: 3 }))
            .unwrap();
        assert_eq!(mgr.active_barrier(), None);
        assert_eq!(*mgr.barrier_watch().borrow(), 3);
    }

    #[test]
    fn exit_cleanup_is_complete() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        output_port(&mut mgr, 1, "data_out");
        input_port(&mut mgr, 2, "grid_in");
        connect(&mut mgr, (1, "data_out"), (2, "grid_in"));
        from_module(&mut mgr, 1, Message::Busy { module_id: 1 });
        mgr.handle(Envelope::new(CONTROLLER, BROADCAST, Message::Barrier { id: 1 }))
            .unwrap();
        from_module(&mut mgr, 2, Message::BarrierReached { id: 1, module_id: 2 });
        assert_eq!(mgr.active_barrier(), Some(1));
        drain_all(&captured, &[1, 2]);

        from_module(
            &mut mgr,
            1,
            Message::ModuleExit {
                module_id: 1,
                forwarded: false,
            },
        );
        mgr.tick(); // phase two arrives via the fabric

        assert!(!mgr.is_running(1));
        assert!(!mgr.is_busy(1));
        assert!(!mgr.has_reached(1));
        let inp = PortId::new(2, "grid_in");
        assert!(mgr.state().ports().connection_list(&inp).unwrap().is_empty());
        // the barrier now covers the remaining modules and releases
        assert_eq!(mgr.active_barrier(), None);
        assert_eq!(*mgr.barrier_watch().borrow(), 1);
        // the surviving module is told about the exit
        assert!(drain(&captured, 2)
            .iter()
            .any(|e| matches!(e.payload, Message::ModuleExit { module_id: 1, .. })));
    }

    #[test]
    fn transport_failure_synthesizes_module_exit() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        assert!(mgr.is_running(1));
        captured.lock().clear(); // worker dies without an exit message
        mgr.tick(); // receive error -> synthesized exit, broadcast
        mgr.tick(); // forwarded copy -> teardown
        assert!(!mgr.is_running(1));
    }

    #[test]
    fn add_object_fans_out_to_each_downstream_module_once() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "Generator", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        output_port(&mut mgr, 1, "data_out");
        input_port(&mut mgr, 2, "in");
        input_port(&mut mgr, 3, "in");
        connect(&mut mgr, (1, "data_out"), (2, "in"));
        connect(&mut mgr, (1, "data_out"), (3, "in"));
        from_module(
            &mut mgr,
            3,
            Message::ObjectReceivePolicy {
                module_id: 3,
                policy: ObjectPolicy::NotifyAll,
            },
        );
        drain_all(&captured, &[1, 2, 3]);

        from_module(
            &mut mgr,
            1,
            Message::AddObject {
                sender_id: 1,
                port_name: "data_out".to_string(),
                object: ObjectHandle::new(),
            },
        );

        let for_2 = drain(&captured, 2);
        let adds: Vec<_> = for_2
            .iter()
            .filter(|e| matches!(&e.payload, Message::AddObject { port_name, .. } if port_name == "in"))
            .collect();
        assert_eq!(adds.len(), 1);
        assert_eq!(
            for_2
                .iter()
                .filter(|e| matches!(e.payload, Message::Compute { .. }))
                .count(),
            1
        );
        assert!(!for_2
            .iter()
            .any(|e| matches!(e.payload, Message::ObjectReceived { .. })));

        let for_3 = drain(&captured, 3);
        assert_eq!(
            for_3
                .iter()
                .filter(|e| matches!(e.payload, Message::AddObject { .. }))
                .count(),
            1
        );
        assert_eq!(
            for_3
                .iter()
                .filter(|e| matches!(e.payload, Message::Compute { .. }))
                .count(),
            1
        );
        assert_eq!(
            for_3
                .iter()
                .filter(|e| matches!(e.payload, Message::ObjectReceived { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn linked_parameter_fanout_visits_each_parameter_once() {
        let (mut mgr, captured) = harness();
        for name in ["Generator", "IsoSurface", "Show"] {
            mgr.spawn_module(0, name, 1, 0, 0).unwrap();
        }
        for id in [1, 2, 3] {
            from_module(
                &mut mgr,
                id,
                Message::AddParameter {
                    module_id: id,
                    name: "value".to_string(),
                    value: ParameterValue::Float(0.0),
                },
            );
        }
        // a parameter-link cycle: 1 -> 2 -> 3 -> 1
        connect(&mut mgr, (1, "value"), (2, "value"));
        connect(&mut mgr, (2, "value"), (3, "value"));
        connect(&mut mgr, (3, "value"), (1, "value"));
        drain_all(&captured, &[1, 2, 3]);

        let ack = Envelope::new(
            1,
            CONTROLLER,
            Message::SetParameter {
                sender_id: 1,
                module_id: 1,
                name: "value".to_string(),
                value: ParameterValue::Float(2.5),
                reply: true,
            },
        );
        let correlation = ack.id;
        mgr.handle(ack).unwrap();

        for id in [2, 3] {
            let edits: Vec<Envelope> = drain(&captured, id)
                .into_iter()
                .filter(|e| {
                    matches!(&e.payload, Message::SetParameter { module_id, reply, .. }
                        if *module_id == id && !reply)
                })
                .collect();
            assert_eq!(edits.len(), 1, "module {id} must see exactly one linked edit");
            assert_eq!(edits[0].id, correlation);
        }
        // nothing loops back to the originator
        assert!(!drain(&captured, 1).iter().any(|e| {
            matches!(&e.payload, Message::SetParameter { module_id: 1, reply: false, .. })
        }));
    }

    #[test]
    fn compute_all_targets_only_source_modules() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "Generator", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        output_port(&mut mgr, 1, "data_out");
        input_port(&mut mgr, 2, "grid_in");
        connect(&mut mgr, (1, "data_out"), (2, "grid_in"));
        drain_all(&captured, &[1, 2]);

        mgr.handle(Envelope::new(
            CONTROLLER,
            BROADCAST,
            Message::Compute {
                module_id: BROADCAST,
                execution_count: -1,
                all_ranks: false,
                reason: ComputeReason::Execute,
            },
        ))
        .unwrap();

        assert_eq!(
            drain(&captured, 1)
                .iter()
                .filter(|e| matches!(e.payload, Message::Compute { .. }))
                .count(),
            1
        );
        assert!(drain(&captured, 2)
            .iter()
            .all(|e| !matches!(e.payload, Message::Compute { .. })));
    }

    #[test]
    fn execution_counts_resolve_monotonically() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        drain_all(&captured, &[1]);

        let compute = |count: i64| {
            Envelope::new(
                CONTROLLER,
                1,
                Message::Compute {
                    module_id: 1,
                    execution_count: count,
                    all_ranks: false,
                    reason: ComputeReason::Execute,
                },
            )
        };
        let delivered_count = |captured: &Captured| -> i64 {
            drain(captured, 1)
                .into_iter()
                .find_map(|e| match e.payload {
                    Message::Compute {
                        execution_count, ..
                    } => Some(execution_count),
                    _ => None,
                })
                .unwrap()
        };

        mgr.handle(compute(-1)).unwrap();
        assert_eq!(delivered_count(&captured), 1);
        mgr.handle(compute(10)).unwrap();
        assert_eq!(delivered_count(&captured), 10);
        assert_eq!(mgr.execution_count(), 10);
        mgr.handle(compute(-1)).unwrap();
        assert_eq!(delivered_count(&captured), 11);
        // a stale count is forwarded unmodified without lowering the counter
        mgr.handle(compute(5)).unwrap();
        assert_eq!(delivered_count(&captured), 5);
        assert_eq!(mgr.execution_count(), 11);
    }

    #[test]
    fn overall_reduce_defers_downstream_finish() {
        let (mut mgr, captured) = harness_on(LoopbackFabric::group(2).remove(0));
        mgr.spawn_module(0, "Generator", 2, 0, 0).unwrap(); // ranks 0 and 1
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        output_port(&mut mgr, 1, "data_out");
        input_port(&mut mgr, 2, "grid_in");
        connect(&mut mgr, (1, "data_out"), (2, "grid_in"));
        from_module(
            &mut mgr,
            1,
            Message::ReducePolicy {
                module_id: 1,
                policy: ReducePolicy::OverAll,
            },
        );
        drain_all(&captured, &[1, 2]);

        finish(&mut mgr, 1);
        assert!(drain(&captured, 1).is_empty());
        finish(&mut mgr, 1);
        // all ranks finished: a reduce is synthesized over the fabric and
        // downstream stays quiet until it completes
        for _ in 0..4 {
            mgr.tick();
        }
        assert!(drain(&captured, 1)
            .iter()
            .any(|e| matches!(e.payload, Message::Reduce { module_id: 1, .. })));
        assert!(drain(&captured, 2).is_empty());

        finish(&mut mgr, 1);
        finish(&mut mgr, 1);
        // reduce complete: the finish flows downstream exactly once
        assert_eq!(
            drain(&captured, 2)
                .iter()
                .filter(|e| matches!(
                    e.payload,
                    Message::ExecutionProgress {
                        stage: ExecutionStage::Finish,
                        ..
                    }
                ))
                .count(),
            1
        );
    }

    #[test]
    fn disconnect_defers_only_behind_a_matching_pending_connect() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        input_port(&mut mgr, 2, "grid_in");

        connect(&mut mgr, (1, "data_out"), (2, "grid_in"));
        assert_eq!(mgr.pending_len(), 1);
        mgr.handle(Envelope::new(
            CONTROLLER,
            CONTROLLER,
            Message::Disconnect {
                from_id: 1,
                from_port: "data_out".to_string(),
                to_id: 2,
                to_port: "grid_in".to_string(),
            },
        ))
        .unwrap();
        assert_eq!(mgr.pending_len(), 2);

        // no pending connect for this pair: plain no-op
        mgr.handle(Envelope::new(
            CONTROLLER,
            CONTROLLER,
            Message::Disconnect {
                from_id: 1,
                from_port: "other".to_string(),
                to_id: 2,
                to_port: "grid_in".to_string(),
            },
        ))
        .unwrap();
        assert_eq!(mgr.pending_len(), 2);

        drain_all(&captured, &[1, 2]);
        output_port(&mut mgr, 1, "data_out");
        // replay applies the connect, then the deferred disconnect
        assert_eq!(mgr.pending_len(), 0);
        let out = PortId::new(1, "data_out");
        assert!(mgr.state().ports().connection_list(&out).unwrap().is_empty());
    }

    #[test]
    fn parameter_request_waits_for_registration() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        mgr.handle(Envelope::new(
            CONTROLLER,
            1,
            Message::SetParameter {
                sender_id: CONTROLLER,
                module_id: 1,
                name: "isovalue".to_string(),
                value: ParameterValue::Float(1.0),
                reply: false,
            },
        ))
        .unwrap();
        assert_eq!(mgr.pending_len(), 1);
        drain_all(&captured, &[1]);

        from_module(
            &mut mgr,
            1,
            Message::AddParameter {
                module_id: 1,
                name: "isovalue".to_string(),
                value: ParameterValue::Float(0.5),
            },
        );
        assert_eq!(mgr.pending_len(), 0);
        assert!(drain(&captured, 1).iter().any(|e| {
            matches!(&e.payload, Message::SetParameter { value, reply: false, .. }
                if *value == ParameterValue::Float(1.0))
        }));
    }

    #[test]
    fn newcomer_receives_replayed_history() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "IsoSurface", 1, 0, 0).unwrap();
        from_module(
            &mut mgr,
            1,
            Message::AddParameter {
                module_id: 1,
                name: "isovalue".to_string(),
                value: ParameterValue::Float(0.5),
            },
        );
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();

        let replayed = drain(&captured, 2);
        assert!(replayed
            .iter()
            .any(|e| matches!(&e.payload, Message::Spawn { requested_id: 1, .. })));
        assert!(replayed
            .iter()
            .any(|e| matches!(&e.payload, Message::AddParameter { module_id: 1, .. })));
        assert!(replayed.iter().any(|e| {
            matches!(&e.payload, Message::SetParameter { module_id: 1, reply: true, .. })
        }));
    }

    #[test]
    fn kill_is_forwarded_unconditionally() {
        let (mut mgr, captured) = harness();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        drain_all(&captured, &[1]);
        mgr.handle(Envelope::new(CONTROLLER, 1, Message::Kill { module_id: 1 }))
            .unwrap();
        assert!(drain(&captured, 1)
            .iter()
            .any(|e| matches!(e.payload, Message::Kill { .. })));
        // unknown target: reported, not fatal
        mgr.handle(Envelope::new(CONTROLLER, 9, Message::Kill { module_id: 9 }))
            .unwrap();
    }

    #[test]
    fn busy_bookkeeping_tolerates_protocol_violations() {
        let (mut mgr, _captured) = harness();
        mgr.spawn_module(0, "Show", 1, 0, 0).unwrap();
        from_module(&mut mgr, 1, Message::Busy { module_id: 1 });
        assert!(mgr.is_busy(1));
        from_module(&mut mgr, 1, Message::Busy { module_id: 1 }); // logged, tolerated
        from_module(&mut mgr, 1, Message::Idle { module_id: 1 });
        assert!(!mgr.is_busy(1));
        from_module(&mut mgr, 1, Message::Idle { module_id: 1 }); // logged, tolerated
        assert!(mgr.is_running(1));
    }
}
