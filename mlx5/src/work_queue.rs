//! Send and receive work queues.
//!
//! A work queue descriptor carries only scatter/gather pointers, never
//! payload, so the buffer behind a completed descriptor is found purely by
//! work queue entry index: the queue keeps a slot array of the buffers it
//! has posted, indexed the same way the hardware indexes its descriptors.
//!
//! Receive queues keep themselves full from their shard ([`WorkQueue::refill`]);
//! the shard is provisioned past ring depth so the ring stays full while a
//! surplus of buffers is out on loan to the consumer.
//!
//! Send queues copy small packets into driver-owned buffers and DMA-bind
//! larger ones in place as foreign chains, with an owned buffer at the head
//! carrying the copied headers and the release callback.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mlx_cmd::{Command, CommandGateway, QueueContext, WqState};
use nic_buffers::{
    return_buffer, Buffer, BufferError, BufferShard, LoanedBuffer, PacketCallback, ShardKind,
};
use nic_dma::{DmaAllocator, DmaRegion};

use crate::completion_queue::{Completion, CompletionKind, CompletionQueue};
use crate::error::{Error, Result};
use crate::event_queue::QueueState;

/// Size of one send descriptor (control + ethernet + pointer segments).
const SQE_SIZE: usize = 64;
/// Size of one receive descriptor (a single scatter pointer).
const RQE_SIZE: usize = 16;

/// RX shards hold half again the ring depth.
fn rx_provision(nents: u32) -> usize {
    nents as usize * 3 / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqKind {
    Send { tisn: u32 },
    Receive,
}

/// One hardware work queue plus the buffers it has in flight.
pub struct WorkQueue {
    kind: WqKind,
    wqn: Option<u32>,
    state: QueueState,
    hw_state: WqState,
    ring: DmaRegion,
    doorbell: DmaRegion,
    nents: u32,
    /// Buffers currently posted, by work queue entry index.
    slots: Vec<Option<Buffer>>,
    shard: BufferShard,
    /// Send queues only: shard of region-less buffers for bound memory.
    foreign: Option<BufferShard>,
    bind_threshold: usize,
}

impl WorkQueue {
    /// Allocates a receive queue: ring memory plus an RX shard provisioned
    /// at 150% of ring depth.
    pub fn new_rq(
        nents: u32,
        buffer_size: usize,
        dma: &dyn DmaAllocator,
    ) -> Result<WorkQueue> {
        let ring = dma.allocate(nents as usize * RQE_SIZE, 4096)?;
        let doorbell = dma.allocate(8, 8)?;
        let shard = BufferShard::new(ShardKind::Rx);
        shard.provision(rx_provision(nents), buffer_size, dma)?;
        let mut slots = Vec::with_capacity(nents as usize);
        slots.resize_with(nents as usize, || None);
        Ok(WorkQueue {
            kind: WqKind::Receive,
            wqn: None,
            state: QueueState::Allocated,
            hw_state: WqState::Reset,
            ring,
            doorbell,
            nents,
            slots,
            shard,
            foreign: None,
            bind_threshold: 0,
        })
    }

    /// Allocates a send queue with its owned and foreign shards.
    pub fn new_sq(
        nents: u32,
        tisn: u32,
        buffer_size: usize,
        bind_threshold: usize,
        dma: &dyn DmaAllocator,
    ) -> Result<WorkQueue> {
        let ring = dma.allocate(nents as usize * SQE_SIZE, 4096)?;
        let doorbell = dma.allocate(8, 8)?;
        let shard = BufferShard::new(ShardKind::TxOwned);
        shard.provision(nents as usize, buffer_size, dma)?;
        let foreign = BufferShard::new(ShardKind::TxForeign);
        foreign.provision(nents as usize, 0, dma)?;
        let mut slots = Vec::with_capacity(nents as usize);
        slots.resize_with(nents as usize, || None);
        Ok(WorkQueue {
            kind: WqKind::Send { tisn },
            wqn: None,
            state: QueueState::Allocated,
            hw_state: WqState::Reset,
            ring,
            doorbell,
            nents,
            slots,
            shard,
            foreign: Some(foreign),
            bind_threshold,
        })
    }

    pub fn kind(&self) -> WqKind {
        self.kind
    }

    pub fn wqn(&self) -> Option<u32> {
        self.wqn
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn hw_state(&self) -> WqState {
        self.hw_state
    }

    pub fn shard(&self) -> &BufferShard {
        &self.shard
    }

    /// The bound-memory shard; send queues only.
    pub fn foreign_shard(&self) -> Option<&BufferShard> {
        self.foreign.as_ref()
    }

    fn queue_context(&self, entry_size: usize, uar: u32) -> QueueContext {
        QueueContext {
            ring_addr: self.ring.device_addr(),
            nents: (self.ring.len() / entry_size) as u32,
            doorbell_addr: self.doorbell.device_addr(),
            uar,
        }
    }

    /// Creates the hardware object on its (fixed, one-to-one) completion
    /// queue.
    pub fn create(&mut self, gw: &CommandGateway, cqn: u32, pd: u32, uar: u32) -> Result<()> {
        if self.state != QueueState::Allocated {
            return Err(Error::BadQueueState("work queue create"));
        }
        let wqn = match self.kind {
            WqKind::Send { tisn } => gw.number(&Command::CreateSq {
                queue: self.queue_context(SQE_SIZE, uar),
                cqn,
                tisn,
                pd,
            })?,
            WqKind::Receive => gw.number(&Command::CreateRq {
                queue: self.queue_context(RQE_SIZE, uar),
                cqn,
                pd,
            })?,
        };
        self.wqn = Some(wqn);
        self.state = QueueState::Created;
        debug!("created {} {wqn} on CQ {cqn}", self.kind_name());
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            WqKind::Send { .. } => "SQ",
            WqKind::Receive => "RQ",
        }
    }

    fn modify(&mut self, gw: &CommandGateway, state: WqState) -> Result<()> {
        let wqn = self.wqn.ok_or(Error::BadQueueState("work queue modify"))?;
        let cmd = match self.kind {
            WqKind::Send { .. } => Command::ModifySq { sqn: wqn, state },
            WqKind::Receive => Command::ModifyRq { rqn: wqn, state },
        };
        gw.done(&cmd)?;
        self.hw_state = state;
        Ok(())
    }

    pub fn start(&mut self, gw: &CommandGateway) -> Result<()> {
        if self.state != QueueState::Created || self.hw_state != WqState::Reset {
            return Err(Error::BadQueueState("work queue start"));
        }
        self.modify(gw, WqState::Ready)
    }

    pub fn stop(&mut self, gw: &CommandGateway) -> Result<()> {
        if self.state != QueueState::Created || self.hw_state != WqState::Ready {
            return Err(Error::BadQueueState("work queue stop"));
        }
        self.modify(gw, WqState::Reset)
    }

    /// Fills empty receive descriptors from the shard. Stops quietly when
    /// the shard runs dry; the next completion's refill picks up the slack.
    pub fn refill(&mut self) -> Result<usize> {
        if !matches!(self.kind, WqKind::Receive) {
            return Err(Error::BadQueueState("refill on a send queue"));
        }
        let mut posted = 0;
        for index in 0..self.nents as usize {
            if self.slots[index].is_some() {
                continue;
            }
            let mut buf = match self.shard.take() {
                Ok(buf) => buf,
                Err(BufferError::Exhausted) => break,
                Err(e) => return Err(e.into()),
            };
            buf.set_wqe_index(index as u32);
            self.slots[index] = Some(buf);
            posted += 1;
        }
        Ok(posted)
    }

    /// Posts one outbound packet, given as one or more segments.
    ///
    /// The whole packet is copied into one owned buffer when it fits under
    /// the bind threshold. Otherwise the first segment (the headers) is
    /// copied and every further segment is bound in place as a foreign
    /// chain member. `on_release` fires once, when the head returns to its
    /// shard after the send completion.
    pub fn post(
        &mut self,
        segments: &[&[u8]],
        on_release: Option<PacketCallback>,
    ) -> Result<u32> {
        if self.state != QueueState::Created || self.hw_state != WqState::Ready {
            return Err(Error::BadQueueState("post on a stopped queue"));
        }
        if segments.is_empty() {
            return Err(Error::BadQueueState("post with no segments"));
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::RingFull)? as u32;

        let total: usize = segments.iter().map(|s| s.len()).sum();
        let mut head = self.shard.take()?;
        let result = if total <= self.bind_threshold {
            self.fill_copied(&mut head, segments)
        } else {
            self.fill_bound(&mut head, segments)
        };
        if let Err(e) = result {
            // Walks any chain members already attached too.
            let _ = return_buffer(head);
            return Err(e);
        }

        if let Some(cb) = on_release {
            head.set_release_callback(cb);
        }
        head.set_wqe_index(index);
        self.slots[index as usize] = Some(head);
        Ok(index)
    }

    fn fill_copied(&mut self, head: &mut Buffer, segments: &[&[u8]]) -> Result<()> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total > head.capacity() {
            return Err(Error::Buffer(BufferError::TooLong {
                len: total,
                capacity: head.capacity(),
            }));
        }
        let mut offset = 0;
        for seg in segments {
            head.data_mut()[offset..offset + seg.len()].copy_from_slice(seg);
            offset += seg.len();
        }
        head.set_len(total)?;
        Ok(())
    }

    fn fill_bound(&mut self, head: &mut Buffer, segments: &[&[u8]]) -> Result<()> {
        head.write_packet(segments[0])?;
        let foreign = self
            .foreign
            .as_ref()
            .ok_or(Error::BadQueueState("foreign post on a receive queue"))?;
        for seg in &segments[1..] {
            let mut member = foreign.take()?;
            member.bind_foreign(seg.as_ptr() as u64, seg.len())?;
            head.chain_segment(member);
        }
        Ok(())
    }

    /// Resolves one completion back to its buffer and disposes of it.
    ///
    /// A completion for a slot with no posted buffer means the hardware and
    /// the slot array disagree about what is outstanding, which cannot be
    /// reconciled.
    pub fn complete(&mut self, completion: Completion) -> Result<Option<LoanedBuffer>> {
        let index = completion.wqe_index as usize;
        let buf = self.slots[index]
            .take()
            .unwrap_or_else(|| panic!("completion for empty WQE slot {index}"));
        match completion.kind {
            CompletionKind::TxDone | CompletionKind::RxDiscard => {
                return_buffer(buf)?;
                Ok(None)
            }
            CompletionKind::Rx { len } => {
                let mut buf = buf;
                buf.set_len(len)?;
                Ok(Some(buf.into_loan()?))
            }
        }
    }

    /// How many descriptors currently hold a posted buffer.
    pub fn posted(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns every posted buffer to its shard. Only legal once the queue
    /// is stopped; the hardware may still read descriptors on a ready ring.
    pub fn flush(&mut self) -> Result<()> {
        if self.hw_state == WqState::Ready {
            return Err(Error::BadQueueState("flush on a ready queue"));
        }
        for slot in self.slots.iter_mut() {
            if let Some(buf) = slot.take() {
                return_buffer(buf)?;
            }
        }
        Ok(())
    }

    pub fn destroy(&mut self, gw: &CommandGateway) -> Result<()> {
        if self.state != QueueState::Created {
            return Err(Error::BadQueueState("work queue destroy"));
        }
        assert_ne!(
            self.hw_state,
            WqState::Ready,
            "{} destroyed while still ready",
            self.kind_name()
        );
        let wqn = self.wqn.take().ok_or(Error::BadQueueState("work queue destroy"))?;
        let cmd = match self.kind {
            WqKind::Send { .. } => Command::DestroySq { sqn: wqn },
            WqKind::Receive => Command::DestroyRq { rqn: wqn },
        };
        gw.done(&cmd)?;
        self.state = QueueState::Destroyed;
        debug!("destroyed {} {wqn}", self.kind_name());
        Ok(())
    }

    /// Drains and destroys the queue's buffer shards. Part of pool
    /// teardown, after the queue itself is gone; blocks until every buffer
    /// loaned upward has come back.
    pub fn shutdown_pools(&self) {
        self.shard.shutdown();
        if let Some(foreign) = &self.foreign {
            foreign.shutdown();
        }
    }
}

impl core::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("kind", &self.kind)
            .field("wqn", &self.wqn)
            .field("state", &self.state)
            .field("hw_state", &self.hw_state)
            .field("posted", &self.posted())
            .finish()
    }
}

/// A work queue and its dedicated completion queue, locked as a unit.
#[derive(Debug)]
pub struct Ring {
    pub wq: WorkQueue,
    pub cq: CompletionQueue,
}

/// CQN to ring, shared between the driver and its completion vectors.
/// Lock order: map lock strictly before any ring lock.
pub type RingMap = Arc<Mutex<BTreeMap<u32, Arc<Mutex<Ring>>>>>;

impl Ring {
    /// Drains pending completions, hands deliverable buffers to `sink`, and
    /// (on receive rings) refills the descriptors just vacated.
    pub fn process_completions(
        &mut self,
        sink: &mut dyn FnMut(LoanedBuffer),
    ) -> Result<usize> {
        let completions = self.cq.take_pending();
        let n = completions.len();
        for completion in completions {
            if let Some(loan) = self.wq.complete(completion)? {
                sink(loan);
            }
        }
        if n > 0 && matches!(self.wq.kind(), WqKind::Receive) {
            self.wq.refill()?;
        }
        Ok(n)
    }
}
