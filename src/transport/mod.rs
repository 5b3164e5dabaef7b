//! Message queue transport: per-module point-to-point queues plus the
//! collective control fabric

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::message::{self, Envelope};
use crate::{Error, Result};

/// Capacity of each per-module queue, in messages
pub const QUEUE_CAPACITY: usize = 256;

/// Sending half of a named, bounded FIFO queue
#[derive(Debug)]
pub struct MessageQueue {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

/// Receiving half of a named, bounded FIFO queue
#[derive(Debug)]
pub struct QueueReceiver {
    name: String,
    rx: mpsc::Receiver<Envelope>,
}

/// One directed channel; the controller and the module each hold one end
pub fn queue_pair(name: &str, capacity: usize) -> (MessageQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        MessageQueue {
            name: name.to_string(),
            tx,
        },
        QueueReceiver {
            name: name.to_string(),
            rx,
        },
    )
}

impl MessageQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking send. The frame-size precondition is checked before
    /// anything is enqueued; oversized messages are rejected synchronously.
    pub fn try_send(&self, env: Envelope) -> Result<()> {
        message::encode(&env)?;
        self.tx.try_send(env).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport(format!("queue {} closed", self.name))
            }
        })
    }
}

impl QueueReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking poll. A closed channel is a transport error, not
    /// "empty": the owner of this queue is treated as having exited.
    pub fn try_receive(&mut self) -> Result<Option<Envelope>> {
        match self.rx.try_recv() {
            Ok(env) => Ok(Some(env)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(Error::Transport(format!("queue {} closed", self.name)))
            }
        }
    }

    /// Awaiting receive for worker-side message loops; None when the
    /// sending side is gone
    pub async fn receive(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Collective broadcast over the control fabric.
///
/// Every replica, the sender included, must apply a broadcast frame through
/// the same handler for replicated state to stay consistent; broadcasting
/// is therefore reserved for messages whose effects must occur at every
/// control replica.
pub trait Fabric: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    fn broadcast(&self, frame: &[u8]) -> Result<()>;
    /// Non-blocking poll for the next pending broadcast frame
    fn poll(&self) -> Result<Option<Vec<u8>>>;
}

/// In-process fabric. `broadcast` loops a frame back to every member of
/// the group, including the sender.
pub struct LoopbackFabric {
    rank: i32,
    members: Vec<Arc<Mutex<VecDeque<Vec<u8>>>>>,
}

impl LoopbackFabric {
    /// A group of `size` linked replicas, one fabric handle per rank
    pub fn group(size: i32) -> Vec<Arc<LoopbackFabric>> {
        let inboxes: Vec<Arc<Mutex<VecDeque<Vec<u8>>>>> = (0..size)
            .map(|_| Arc::new(Mutex::new(VecDeque::new())))
            .collect();
        (0..size)
            .map(|rank| {
                Arc::new(LoopbackFabric {
                    rank,
                    members: inboxes.clone(),
                })
            })
            .collect()
    }

    /// The common single-replica case
    pub fn solo() -> Arc<LoopbackFabric> {
        Self::group(1).remove(0)
    }
}

impl Fabric for LoopbackFabric {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.members.len() as i32
    }

    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        for inbox in &self.members {
            inbox.lock().push_back(frame.to_vec());
        }
        Ok(())
    }

    fn poll(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.members[self.rank as usize].lock().pop_front())
    }
}
