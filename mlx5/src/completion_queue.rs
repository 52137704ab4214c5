//! Completion queues.
//!
//! Each completion queue reports to exactly one event queue, chosen
//! round-robin over the non-control queues when the CQ is created and fixed
//! for its lifetime. Each is also paired one-to-one with a single work
//! queue; sharing a CQ between work queues would make completion-to-buffer
//! mapping ambiguous and let one busy ring delay another's buffer releases.
//!
//! A completion entry carries nothing but the work queue entry index it
//! refers to (plus kind and length); buffer identity is recovered purely
//! from that index. Interrupt glue pushes entries through
//! [`CompletionQueue::push`] under the queue's own pending lock, so posting
//! never waits on ring processing.

use std::collections::VecDeque;
use std::sync::Mutex;

use mlx_cmd::{Command, CommandGateway, QueueContext};
use nic_dma::{DmaAllocator, DmaRegion};

use crate::error::{Error, Result};
use crate::event_queue::QueueState;

/// Size of one hardware completion queue entry.
const CQE_SIZE: usize = 64;

/// What one completion reports about its work queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Send finished; the buffer (or chain) can go back to its shard.
    TxDone,
    /// Receive finished with `len` valid bytes; deliver upward.
    Rx { len: usize },
    /// Receive finished but the packet is not deliverable (bad FCS,
    /// truncation); recycle the buffer without delivering it.
    RxDiscard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wqe_index: u32,
    pub kind: CompletionKind,
}

/// One hardware completion queue.
#[derive(Debug)]
pub struct CompletionQueue {
    cqn: Option<u32>,
    eqn: Option<u32>,
    state: QueueState,
    ring: DmaRegion,
    doorbell: DmaRegion,
    pending: Mutex<VecDeque<Completion>>,
}

impl CompletionQueue {
    pub fn new(nents: u32, dma: &dyn DmaAllocator) -> Result<CompletionQueue> {
        let ring = dma.allocate(nents as usize * CQE_SIZE, 4096)?;
        let doorbell = dma.allocate(8, 8)?;
        Ok(CompletionQueue {
            cqn: None,
            eqn: None,
            state: QueueState::Allocated,
            ring,
            doorbell,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn cqn(&self) -> Option<u32> {
        self.cqn
    }

    /// The event queue this CQ reports to.
    pub fn eqn(&self) -> Option<u32> {
        self.eqn
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Creates the hardware object, bound to `eqn` for good.
    pub fn create(
        &mut self,
        gw: &CommandGateway,
        eqn: u32,
        uar: u32,
        mod_period_usec: u16,
        mod_count: u16,
    ) -> Result<()> {
        if self.state != QueueState::Allocated {
            return Err(Error::BadQueueState("completion queue create"));
        }
        let nents = (self.ring.len() / CQE_SIZE) as u32;
        let cqn = gw.number(&Command::CreateCq {
            queue: QueueContext {
                ring_addr: self.ring.device_addr(),
                nents,
                doorbell_addr: self.doorbell.device_addr(),
                uar,
            },
            eqn,
            mod_period_usec,
            mod_count,
        })?;
        self.cqn = Some(cqn);
        self.eqn = Some(eqn);
        self.state = QueueState::Created;
        debug!("created CQ {cqn} on EQ {eqn}");
        Ok(())
    }

    /// Queues one completion for processing. Called from interrupt glue.
    pub fn push(&self, completion: Completion) {
        self.pending.lock().expect("completion queue poisoned").push_back(completion);
    }

    /// Takes everything currently pending.
    pub fn take_pending(&self) -> Vec<Completion> {
        self.pending.lock().expect("completion queue poisoned").drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("completion queue poisoned").len()
    }

    pub fn destroy(&mut self, gw: &CommandGateway) -> Result<()> {
        if self.state != QueueState::Created {
            return Err(Error::BadQueueState("completion queue destroy"));
        }
        let cqn = self.cqn.take().ok_or(Error::BadQueueState("completion queue destroy"))?;
        gw.done(&Command::DestroyCq { cqn })?;
        self.state = QueueState::Destroyed;
        debug!("destroyed CQ {cqn}");
        Ok(())
    }
}
