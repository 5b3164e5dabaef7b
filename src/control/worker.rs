//! Generic worker-side message loop
//!
//! Concrete modules implement [`Worker`]; [`run_worker`] drives one over
//! its queue pair until the controller tells it to go away. The control
//! plane itself never interprets what `compute` produces.

use tracing::{debug, warn};

use crate::control::library::WorkerContext;
use crate::core::message::{
    Envelope, ExecutionStage, Message, ObjectHandle, ObjectPolicy, ReducePolicy, SchedulingPolicy,
    Severity, CONTROLLER,
};
use crate::core::parameter::ParameterValue;

/// Ports, parameters and policies a worker announces right after startup
#[derive(Debug, Clone, Default)]
pub struct WorkerDescription {
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
    pub parameters: Vec<(String, ParameterValue)>,
    pub scheduling: Option<SchedulingPolicy>,
    pub object_policy: Option<ObjectPolicy>,
    pub reduce_policy: Option<ReducePolicy>,
}

/// What a concrete worker module does between control messages
#[async_trait::async_trait]
pub trait Worker: Send {
    fn describe(&self) -> WorkerDescription;

    /// One compute round; returns emitted objects per output port name
    async fn compute(&mut self) -> crate::Result<Vec<(String, ObjectHandle)>>;

    /// Parameter edit arriving from the controller; the returned value is
    /// acknowledged as the new canonical one
    fn set_parameter(&mut self, _name: &str, value: ParameterValue) -> ParameterValue {
        value
    }
}

/// Drives a worker over its queue pair until Kill or Quit
pub async fn run_worker<W: Worker>(mut worker: W, mut ctx: WorkerContext) {
    let id = ctx.id;
    let send = |queue: &crate::transport::MessageQueue, env: Envelope| {
        if let Err(e) = queue.try_send(env) {
            warn!(module = id, "worker send failed: {e}");
        }
    };

    let desc = worker.describe();
    send(
        &ctx.send,
        Envelope::new(
            id,
            CONTROLLER,
            Message::Started {
                module_id: id,
                name: ctx.name.clone(),
            },
        ),
    );
    for name in &desc.input_ports {
        send(
            &ctx.send,
            Envelope::new(
                id,
                CONTROLLER,
                Message::CreateInputPort {
                    module_id: id,
                    name: name.clone(),
                },
            ),
        );
    }
    for name in &desc.output_ports {
        send(
            &ctx.send,
            Envelope::new(
                id,
                CONTROLLER,
                Message::CreateOutputPort {
                    module_id: id,
                    name: name.clone(),
                },
            ),
        );
    }
    for (name, value) in &desc.parameters {
        send(
            &ctx.send,
            Envelope::new(
                id,
                CONTROLLER,
                Message::AddParameter {
                    module_id: id,
                    name: name.clone(),
                    value: value.clone(),
                },
            ),
        );
    }
    if let Some(policy) = desc.scheduling {
        send(
            &ctx.send,
            Envelope::new(id, CONTROLLER, Message::SchedulingPolicy { module_id: id, policy }),
        );
    }
    if let Some(policy) = desc.object_policy {
        send(
            &ctx.send,
            Envelope::new(id, CONTROLLER, Message::ObjectReceivePolicy { module_id: id, policy }),
        );
    }
    if let Some(policy) = desc.reduce_policy {
        send(
            &ctx.send,
            Envelope::new(id, CONTROLLER, Message::ReducePolicy { module_id: id, policy }),
        );
    }

    while let Some(env) = ctx.recv.receive().await {
        match env.payload {
            Message::Compute { .. } => {
                send(
                    &ctx.send,
                    Envelope::new(id, CONTROLLER, Message::Busy { module_id: id }),
                );
                send(
                    &ctx.send,
                    Envelope::new(
                        id,
                        CONTROLLER,
                        Message::ExecutionProgress {
                            module_id: id,
                            stage: ExecutionStage::Start,
                        },
                    ),
                );
                match worker.compute().await {
                    Ok(objects) => {
                        for (port_name, object) in objects {
                            send(
                                &ctx.send,
                                Envelope::new(
                                    id,
                                    CONTROLLER,
                                    Message::AddObject {
                                        sender_id: id,
                                        port_name,
                                        object,
                                    },
                                ),
                            );
                        }
                    }
                    Err(e) => {
                        send(
                            &ctx.send,
                            Envelope::new(
                                id,
                                CONTROLLER,
                                Message::Text {
                                    severity: Severity::Error,
                                    text: format!("compute failed: {e}"),
                                },
                            ),
                        );
                    }
                }
                send(
                    &ctx.send,
                    Envelope::new(
                        id,
                        CONTROLLER,
                        Message::ExecutionProgress {
                            module_id: id,
                            stage: ExecutionStage::Finish,
                        },
                    ),
                );
                send(
                    &ctx.send,
                    Envelope::new(id, CONTROLLER, Message::Idle { module_id: id }),
                );
            }
            Message::SetParameter {
                module_id,
                name,
                value,
                reply,
                ..
            } if module_id == id && !reply => {
                let value = worker.set_parameter(&name, value);
                send(
                    &ctx.send,
                    Envelope::correlated(
                        env.id,
                        id,
                        CONTROLLER,
                        Message::SetParameter {
                            sender_id: id,
                            module_id: id,
                            name,
                            value,
                            reply: true,
                        },
                    ),
                );
            }
            Message::Reduce { .. } => {
                // a further Finish signals reduce completion upstream
                send(
                    &ctx.send,
                    Envelope::new(
                        id,
                        CONTROLLER,
                        Message::ExecutionProgress {
                            module_id: id,
                            stage: ExecutionStage::Finish,
                        },
                    ),
                );
            }
            Message::Barrier { id: barrier_id } => {
                send(
                    &ctx.send,
                    Envelope::new(
                        id,
                        CONTROLLER,
                        Message::BarrierReached {
                            id: barrier_id,
                            module_id: id,
                        },
                    ),
                );
            }
            Message::Ping { c } => {
                send(
                    &ctx.send,
                    Envelope::new(id, CONTROLLER, Message::Pong { module_id: id, c }),
                );
            }
            Message::Kill { .. } | Message::Quit => {
                send(
                    &ctx.send,
                    Envelope::new(
                        id,
                        CONTROLLER,
                        Message::ModuleExit {
                            module_id: id,
                            forwarded: false,
                        },
                    ),
                );
                break;
            }
            other => {
                debug!(module = id, "worker ignoring {other:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use crate::transport::queue_pair;

    struct Doubler {
        factor: i32,
    }

    #[async_trait::async_trait]
    impl Worker for Doubler {
        fn describe(&self) -> WorkerDescription {
            WorkerDescription {
                input_ports: vec!["data_in".into()],
                output_ports: vec!["data_out".into()],
                parameters: vec![("factor".into(), ParameterValue::Int(self.factor))],
                ..Default::default()
            }
        }

        async fn compute(&mut self) -> crate::Result<Vec<(String, ObjectHandle)>> {
            Ok(vec![("data_out".into(), ObjectHandle::new())])
        }

        fn set_parameter(&mut self, name: &str, value: ParameterValue) -> ParameterValue {
            if name == "factor" {
                if let ParameterValue::Int(v) = value {
                    self.factor = v;
                }
            }
            ParameterValue::Int(self.factor)
        }
    }

    #[tokio::test]
    async fn worker_announces_itself_and_computes() {
        let (ctrl_send, worker_recv) = queue_pair("w_recv", 32);
        let (worker_send, mut ctrl_recv) = queue_pair("w_send", 32);
        let ctx = crate::control::library::WorkerContext {
            id: 1,
            name: "Doubler".into(),
            ranks: vec![0],
            recv: worker_recv,
            send: worker_send,
        };
        let task = tokio::spawn(run_worker(Doubler { factor: 2 }, ctx));

        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::Started { module_id: 1, .. }
        ));
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::CreateInputPort { .. }
        ));
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::CreateOutputPort { .. }
        ));
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::AddParameter { .. }
        ));

        ctrl_send
            .try_send(Envelope::new(
                CONTROLLER,
                1,
                Message::Compute {
                    module_id: 1,
                    execution_count: 1,
                    all_ranks: false,
                    reason: crate::core::message::ComputeReason::Execute,
                },
            ))
            .unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(ctrl_recv.receive().await.unwrap().payload);
        }
        assert!(matches!(seen[0], Message::Busy { .. }));
        assert!(matches!(
            seen[1],
            Message::ExecutionProgress {
                stage: ExecutionStage::Start,
                ..
            }
        ));
        assert!(matches!(seen[2], Message::AddObject { .. }));
        assert!(matches!(
            seen[3],
            Message::ExecutionProgress {
                stage: ExecutionStage::Finish,
                ..
            }
        ));
        assert!(matches!(seen[4], Message::Idle { .. }));

        // parameter edits are acknowledged with the worker's value
        let edit = Envelope::new(
            CONTROLLER,
            1,
            Message::SetParameter {
                sender_id: CONTROLLER,
                module_id: 1,
                name: "factor".into(),
                value: ParameterValue::Int(7),
                reply: false,
            },
        );
        let correlation = edit.id;
        ctrl_send.try_send(edit).unwrap();
        let ack = ctrl_recv.receive().await.unwrap();
        assert_eq!(ack.id, correlation);
        assert!(matches!(
            ack.payload,
            Message::SetParameter {
                value: ParameterValue::Int(7),
                reply: true,
                ..
            }
        ));

        ctrl_send
            .try_send(Envelope::new(CONTROLLER, 1, Message::Kill { module_id: 1 }))
            .unwrap();
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::ModuleExit {
                module_id: 1,
                forwarded: false,
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn worker_acknowledges_barriers_and_pings() {
        let (ctrl_send, worker_recv) = queue_pair("w_recv", 8);
        let (worker_send, mut ctrl_recv) = queue_pair("w_send", 8);
        let ctx = crate::control::library::WorkerContext {
            id: 4,
            name: "Doubler".into(),
            ranks: vec![0],
            recv: worker_recv,
            send: worker_send,
        };
        tokio::spawn(run_worker(Doubler { factor: 1 }, ctx));
        for _ in 0..4 {
            ctrl_recv.receive().await.unwrap(); // announcement burst
        }

        ctrl_send
            .try_send(Envelope::new(CONTROLLER, 4, Message::Barrier { id: 9 }))
            .unwrap();
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::BarrierReached { id: 9, module_id: 4 }
        ));

        ctrl_send
            .try_send(Envelope::new(CONTROLLER, 4, Message::Ping { c: 'p' }))
            .unwrap();
        assert!(matches!(
            ctrl_recv.receive().await.unwrap().payload,
            Message::Pong { module_id: 4, c: 'p' }
        ));
    }
}
