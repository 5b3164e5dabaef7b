//! Control message taxonomy and wire codec

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::parameter::ParameterValue;

/// Destination id addressing every reachable peer
pub const BROADCAST: i32 = -1;
/// Sender id used by the controller and its clients
pub const CONTROLLER: i32 = 0;
/// First id handed out by the module counter
pub const FIRST_MODULE_ID: i32 = 1;

/// Hard upper bound on an encoded control message frame
pub const MAX_FRAME_SIZE: u64 = 8192;

/// Unique message identifier; doubles as the correlation id for
/// request/reply pairs such as parameter edits and their acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a data object; the control plane never interprets
/// payload contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(Uuid);

impl ObjectHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Severity tag on user-visible text messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Execution progress stages reported by worker ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStage {
    Start,
    Finish,
    Iteration,
    Timestep,
}

/// Whether compute messages go to one rank of a module or to all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    Single,
    Gang,
}

/// How object arrivals are made known to a module's ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectPolicy {
    Local,
    NotifyAll,
    Distribute,
}

/// Whether a reduction step is auto-triggered after execution finishes on
/// all ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReducePolicy {
    Never,
    PerTimestep,
    OverAll,
}

/// Why a compute round was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeReason {
    Execute,
    AddedObject,
    ParameterChanged,
}

/// Control message kinds.
///
/// This is a closed union: the dispatcher matches exhaustively, so adding a
/// kind fails compilation until every handler site is updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Spawn {
        requested_id: i32,
        name: String,
        mpi_size: i32,
        rank_skip: i32,
        base_rank: i32,
    },
    Started {
        module_id: i32,
        name: String,
    },
    ModuleExit {
        module_id: i32,
        forwarded: bool,
    },
    CreateInputPort {
        module_id: i32,
        name: String,
    },
    CreateOutputPort {
        module_id: i32,
        name: String,
    },
    Connect {
        from_id: i32,
        from_port: String,
        to_id: i32,
        to_port: String,
    },
    Disconnect {
        from_id: i32,
        from_port: String,
        to_id: i32,
        to_port: String,
    },
    Compute {
        module_id: i32,
        execution_count: i64,
        all_ranks: bool,
        reason: ComputeReason,
    },
    Reduce {
        module_id: i32,
        timestep: i32,
    },
    ExecutionProgress {
        module_id: i32,
        stage: ExecutionStage,
    },
    Busy {
        module_id: i32,
    },
    Idle {
        module_id: i32,
    },
    AddObject {
        sender_id: i32,
        port_name: String,
        object: ObjectHandle,
    },
    ObjectReceived {
        sender_id: i32,
        port_name: String,
        object: ObjectHandle,
    },
    AddParameter {
        module_id: i32,
        name: String,
        value: ParameterValue,
    },
    SetParameter {
        sender_id: i32,
        module_id: i32,
        name: String,
        value: ParameterValue,
        reply: bool,
    },
    SetParameterChoices {
        module_id: i32,
        name: String,
        choices: Vec<String>,
    },
    SchedulingPolicy {
        module_id: i32,
        policy: SchedulingPolicy,
    },
    ObjectReceivePolicy {
        module_id: i32,
        policy: ObjectPolicy,
    },
    ReducePolicy {
        module_id: i32,
        policy: ReducePolicy,
    },
    Kill {
        module_id: i32,
    },
    Barrier {
        id: u64,
    },
    BarrierReached {
        id: u64,
        module_id: i32,
    },
    Ping {
        c: char,
    },
    Pong {
        module_id: i32,
        c: char,
    },
    ResetModuleIds,
    Text {
        severity: Severity,
        text: String,
    },
    Quit,
}

/// Routed message wrapper: correlation id plus sender and destination
/// module ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub sender: i32,
    pub dest: i32,
    pub payload: Message,
}

impl Envelope {
    pub fn new(sender: i32, dest: i32, payload: Message) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            dest,
            payload,
        }
    }

    /// Build a message carrying an existing correlation id, so replies and
    /// fan-out copies can be matched to the original request
    pub fn correlated(id: MessageId, sender: i32, dest: i32, payload: Message) -> Self {
        Self {
            id,
            sender,
            dest,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST
    }
}

/// Encode for the wire; the frame-size precondition is checked before any
/// queue sees the bytes
pub fn encode(env: &Envelope) -> crate::Result<Vec<u8>> {
    let size = bincode::serialized_size(env)?;
    if size > MAX_FRAME_SIZE {
        return Err(crate::Error::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bincode::serialize(env)?)
}

pub fn decode(frame: &[u8]) -> crate::Result<Envelope> {
    Ok(bincode::deserialize(frame)?)
}
