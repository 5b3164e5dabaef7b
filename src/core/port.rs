//! Port registry and the connection graph between modules

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Port direction. Parameter ports carry linked-parameter edges and never
/// transport objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Input,
    Output,
    Parameter,
}

/// Port identity: (owning module, name). Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortId {
    pub module: i32,
    pub name: String,
}

impl PortId {
    pub fn new(module: i32, name: impl Into<String>) -> Self {
        Self {
            module,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub kind: PortKind,
}

/// Per-process catalog of ports owned by modules and the connection graph
/// between them. Connections keep symmetric bookkeeping at both endpoints.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    ports: HashMap<PortId, Port>,
    connections: HashMap<PortId, Vec<PortId>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: returns the existing port if (module, name) is already
    /// registered, else creates it with an empty connection list
    pub fn add_port(&mut self, module: i32, name: &str, kind: PortKind) -> &Port {
        let id = PortId::new(module, name);
        if let Some(existing) = self.ports.get(&id) {
            if existing.kind != kind {
                warn!(module, name, "port re-registered with different kind, keeping original");
            }
        }
        self.connections.entry(id.clone()).or_default();
        self.ports
            .entry(id.clone())
            .or_insert_with(|| Port { id, kind })
    }

    pub fn port(&self, module: i32, name: &str) -> Option<&Port> {
        self.ports.get(&PortId::new(module, name))
    }

    /// Ports of one module with the given kind, in name order
    pub fn module_ports(&self, module: i32, kind: PortKind) -> Vec<&Port> {
        let mut ports: Vec<&Port> = self
            .ports
            .values()
            .filter(|p| p.id.module == module && p.kind == kind)
            .collect();
        ports.sort_by(|a, b| a.id.name.cmp(&b.id.name));
        ports
    }

    /// Symmetric edge insertion. Only OUTPUT -> INPUT edges (object flow)
    /// and PARAMETER <-> PARAMETER edges (linked parameters) are legal;
    /// anything else is a no-op returning false. Re-adding an existing
    /// connection is a successful no-op.
    pub fn add_connection(&mut self, from: &PortId, to: &PortId) -> bool {
        let legal = match (self.ports.get(from), self.ports.get(to)) {
            (Some(f), Some(t)) => matches!(
                (f.kind, t.kind),
                (PortKind::Output, PortKind::Input) | (PortKind::Parameter, PortKind::Parameter)
            ),
            _ => false,
        };
        if !legal {
            return false;
        }
        let out_list = self.connections.entry(from.clone()).or_default();
        if out_list.contains(to) {
            return true;
        }
        out_list.push(to.clone());
        self.connections.entry(to.clone()).or_default().push(from.clone());
        true
    }

    /// Removes `b` from `a`'s list and `a` from `b`'s list; returns whether
    /// anything was removed
    pub fn remove_connection(&mut self, a: &PortId, b: &PortId) -> bool {
        let mut removed = false;
        if let Some(list) = self.connections.get_mut(a) {
            let before = list.len();
            list.retain(|p| p != b);
            removed |= list.len() < before;
        }
        if let Some(list) = self.connections.get_mut(b) {
            let before = list.len();
            list.retain(|p| p != a);
            removed |= list.len() < before;
        }
        removed
    }

    /// Drains every connection touching the module's ports, both
    /// directions. If a removal fails to shrink a list the registry is
    /// inconsistent; that port's cleanup is abandoned rather than looping
    /// forever.
    pub fn remove_connections(&mut self, module: i32) {
        let owned: Vec<PortId> = self
            .ports
            .keys()
            .filter(|p| p.module == module)
            .cloned()
            .collect();
        for pid in owned {
            loop {
                let peer = match self.connections.get(&pid) {
                    Some(list) if !list.is_empty() => list[0].clone(),
                    _ => break,
                };
                let before = self.connections.get(&pid).map(Vec::len).unwrap_or(0);
                self.remove_connection(&pid, &peer);
                let after = self.connections.get(&pid).map(Vec::len).unwrap_or(0);
                if after >= before {
                    error!(module, port = %pid.name, "connection list did not shrink, aborting cleanup");
                    break;
                }
            }
        }
    }

    /// Drops a module's connections and then the ports themselves
    pub fn remove_module(&mut self, module: i32) {
        self.remove_connections(module);
        self.ports.retain(|id, _| id.module != module);
        self.connections.retain(|id, _| id.module != module);
    }

    pub fn connection_list(&self, port: &PortId) -> Option<&[PortId]> {
        self.connections.get(port).map(Vec::as_slice)
    }
}
