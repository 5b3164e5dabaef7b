//! Parameter store: per-module named, typed values

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Parameter value container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Int(i32),
    Float(f32),
    String(String),
    Bool(bool),
    VecInt(Vec<i32>),
    VecFloat(Vec<f32>),
    VecString(Vec<String>),
}

/// Parameter type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    Int,
    Float,
    String,
    Bool,
    VecInt,
    VecFloat,
    VecString,
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Int(_) => ParameterKind::Int,
            ParameterValue::Float(_) => ParameterKind::Float,
            ParameterValue::String(_) => ParameterKind::String,
            ParameterValue::Bool(_) => ParameterKind::Bool,
            ParameterValue::VecInt(_) => ParameterKind::VecInt,
            ParameterValue::VecFloat(_) => ParameterKind::VecFloat,
            ParameterValue::VecString(_) => ParameterKind::VecString,
        }
    }
}

/// Parameter definition; the canonical value lives in the owning module,
/// this is the controller-side mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
    pub choices: Vec<String>,
}

impl Parameter {
    pub fn new(name: &str, value: ParameterValue) -> Self {
        Self {
            name: name.to_string(),
            value,
            choices: Vec::new(),
        }
    }

    pub fn kind(&self) -> ParameterKind {
        self.value.kind()
    }
}

/// Parameters of every known module, keyed by (module id, name)
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    params: HashMap<(i32, String), Parameter>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First registration wins; a duplicate name for the same module is a
    /// corruption signal, logged while the original is kept
    pub fn add(&mut self, module: i32, name: &str, value: ParameterValue) -> bool {
        let key = (module, name.to_string());
        if self.params.contains_key(&key) {
            warn!(module, name, "duplicate parameter registration, keeping original");
            return false;
        }
        self.params.insert(key, Parameter::new(name, value));
        true
    }

    pub fn get(&self, module: i32, name: &str) -> Option<&Parameter> {
        self.params.get(&(module, name.to_string()))
    }

    /// Type-checked update of the mirrored value
    pub fn set_value(&mut self, module: i32, name: &str, value: ParameterValue) -> crate::Result<()> {
        let param = self
            .params
            .get_mut(&(module, name.to_string()))
            .ok_or_else(|| crate::Error::Protocol(format!("no parameter {name} on module {module}")))?;
        if param.kind() != value.kind() {
            return Err(crate::Error::Protocol(format!(
                "type mismatch for parameter {name} on module {module}"
            )));
        }
        param.value = value;
        Ok(())
    }

    pub fn set_choices(&mut self, module: i32, name: &str, choices: Vec<String>) -> crate::Result<()> {
        let param = self
            .params
            .get_mut(&(module, name.to_string()))
            .ok_or_else(|| crate::Error::Protocol(format!("no parameter {name} on module {module}")))?;
        param.choices = choices;
        Ok(())
    }

    /// Parameters owned by one module, in name order
    pub fn module_parameters(&self, module: i32) -> Vec<&Parameter> {
        let mut params: Vec<&Parameter> = self
            .params
            .iter()
            .filter(|((m, _), _)| *m == module)
            .map(|(_, p)| p)
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }

    pub fn remove_module(&mut self, module: i32) {
        self.params.retain(|(m, _), _| *m != module);
    }
}
