//! Consolidated view of running modules, ports, connections and
//! parameters, kept consistent by replaying the control message stream

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::message::{
    Envelope, Message, ObjectPolicy, ReducePolicy, SchedulingPolicy, FIRST_MODULE_ID,
};
use crate::core::parameter::{Parameter, ParameterMap};
use crate::core::port::{PortId, PortKind, PortRegistry};

/// Mirror of one module's externally visible state
#[derive(Debug, Clone)]
pub struct ModuleView {
    pub id: i32,
    pub name: String,
    pub initialized: bool,
    pub busy: bool,
    pub scheduling: SchedulingPolicy,
    pub object_policy: ObjectPolicy,
    pub reduce_policy: ReducePolicy,
}

impl ModuleView {
    fn new(id: i32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            initialized: false,
            busy: false,
            scheduling: SchedulingPolicy::Single,
            object_policy: ObjectPolicy::Local,
            reduce_policy: ReducePolicy::Never,
        }
    }
}

/// Pure reducer over the control message stream.
///
/// The authoritative module manager and any read-only observer both build
/// their picture of the cluster by feeding the same messages through
/// `handle`. Applying a message twice must not corrupt the mirror, so every
/// arm is written to be replay-safe.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    modules: HashMap<i32, ModuleView>,
    ports: PortRegistry,
    params: ParameterMap,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(&self, id: i32) -> Option<&ModuleView> {
        self.modules.get(&id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleView> {
        self.modules.values()
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn parameter(&self, module: i32, name: &str) -> Option<&Parameter> {
        self.params.get(module, name)
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.params
    }

    /// Apply one message to the mirror; returns whether it changed anything
    pub fn handle(&mut self, env: &Envelope) -> bool {
        match &env.payload {
            Message::Spawn {
                requested_id, name, ..
            } => {
                if *requested_id < FIRST_MODULE_ID || self.modules.contains_key(requested_id) {
                    return false;
                }
                self.modules
                    .insert(*requested_id, ModuleView::new(*requested_id, name));
                true
            }
            Message::Started { module_id, .. } => match self.modules.get_mut(module_id) {
                Some(view) if !view.initialized => {
                    view.initialized = true;
                    true
                }
                _ => false,
            },
            Message::ModuleExit {
                module_id,
                forwarded,
            } => {
                // only the forwarded copy, which every replica sees, tears
                // down the mirror
                if !*forwarded || !self.modules.contains_key(module_id) {
                    return false;
                }
                self.modules.remove(module_id);
                self.ports.remove_module(*module_id);
                self.params.remove_module(*module_id);
                true
            }
            Message::CreateInputPort { module_id, name } => {
                self.ports.add_port(*module_id, name, PortKind::Input);
                true
            }
            Message::CreateOutputPort { module_id, name } => {
                self.ports.add_port(*module_id, name, PortKind::Output);
                true
            }
            Message::Connect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => self.ports.add_connection(
                &PortId::new(*from_id, from_port.clone()),
                &PortId::new(*to_id, to_port.clone()),
            ),
            Message::Disconnect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => self.ports.remove_connection(
                &PortId::new(*from_id, from_port.clone()),
                &PortId::new(*to_id, to_port.clone()),
            ),
            Message::AddParameter {
                module_id,
                name,
                value,
            } => {
                let added = self.params.add(*module_id, name, value.clone());
                if added {
                    // parameters are exposed as parameter ports so linked
                    // values can ride the ordinary connection graph
                    self.ports.add_port(*module_id, name, PortKind::Parameter);
                }
                added
            }
            Message::SetParameter {
                sender_id,
                module_id,
                name,
                value,
                reply,
            } => {
                // the mirror follows the canonical value, which only the
                // owning module may confirm
                if !*reply && sender_id != module_id {
                    return false;
                }
                match self.params.set_value(*module_id, name, value.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(module = module_id, name = %name, "mirror update skipped: {e}");
                        false
                    }
                }
            }
            Message::SetParameterChoices {
                module_id,
                name,
                choices,
            } => match self.params.set_choices(*module_id, name, choices.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(module = module_id, name = %name, "choices update skipped: {e}");
                    false
                }
            },
            Message::Busy { module_id } => {
                if let Some(view) = self.modules.get_mut(module_id) {
                    view.busy = true;
                    return true;
                }
                false
            }
            Message::Idle { module_id } => {
                if let Some(view) = self.modules.get_mut(module_id) {
                    view.busy = false;
                    return true;
                }
                false
            }
            Message::SchedulingPolicy { module_id, policy } => {
                if let Some(view) = self.modules.get_mut(module_id) {
                    view.scheduling = *policy;
                    return true;
                }
                warn!(module = module_id, "scheduling policy for unknown module");
                false
            }
            Message::ObjectReceivePolicy { module_id, policy } => {
                if let Some(view) = self.modules.get_mut(module_id) {
                    view.object_policy = *policy;
                    return true;
                }
                warn!(module = module_id, "object policy for unknown module");
                false
            }
            Message::ReducePolicy { module_id, policy } => {
                if let Some(view) = self.modules.get_mut(module_id) {
                    view.reduce_policy = *policy;
                    return true;
                }
                warn!(module = module_id, "reduce policy for unknown module");
                false
            }
            // pure notifications; nothing to mirror
            Message::Compute { .. }
            | Message::Reduce { .. }
            | Message::ExecutionProgress { .. }
            | Message::AddObject { .. }
            | Message::ObjectReceived { .. }
            | Message::Kill { .. }
            | Message::Barrier { .. }
            | Message::BarrierReached { .. }
            | Message::Ping { .. }
            | Message::Pong { .. }
            | Message::ResetModuleIds
            | Message::Text { .. }
            | Message::Quit => false,
        }
    }
}
