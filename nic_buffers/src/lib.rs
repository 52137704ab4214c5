//! Defines the packet buffers used to send and receive frames, and the
//! sharded pools that track their ownership.
//!
//! # Buffer lifecycle: RX
//!
//! An RX [`Buffer`] has all of its memory allocated when the ring it belongs
//! to is started, then sits on the free list of its [`BufferShard`]. Ring
//! refill takes it off the free list and marks it on-queue before building a
//! work queue entry for it. After a completion the packet is either discarded
//! (buffer straight back to the free list) or loaned upward as a
//! [`LoanedBuffer`]; dropping the loan returns the buffer to its shard.
//!
//! ```text
//!  created -> free -> on-queue -> free            (discarded on completion)
//!                  \          \-> on-loan -> free (consumer drops the loan)
//!  free -> dead                                   (shard teardown only)
//! ```
//!
//! # Buffer lifecycle: TX
//!
//! TX buffers come in two kinds: *owned* buffers, whose memory this crate
//! allocates and packets are copied into, and *foreign* buffers, which borrow
//! the producer's own memory for the duration of the send and only record its
//! DMA-bound address. The two kinds live in separate shards with separate
//! locks, so a producer releasing foreign memory never contends with owned
//! allocation.
//!
//! A multi-segment packet becomes a chain of buffers hanging off a head
//! buffer. Returning the head walks the whole chain, hands every member back
//! to its own shard, and fires the packet-release callback exactly once.
//!
//! At teardown, buffers are only ever destroyed from the free list; a shard
//! blocks until everything busy has come home first.

#[macro_use]
extern crate log;

use core::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};

use nic_dma::{DmaAllocator, DmaError, DmaRegion};

/// Called exactly once when the head of a TX chain is released, so the
/// producer can free the original packet.
pub type PacketCallback = Box<dyn FnOnce() + Send>;

/// Where a buffer currently is. Exactly one place may hold a buffer at any
/// instant; the state exists to catch anyone breaking that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated but not yet handed to its shard.
    Created,
    /// On its shard's free list.
    Free,
    /// Referenced by a work queue slot (possibly as a chain member).
    OnWq,
    /// Loaned to the consumer above us.
    Loaned,
    /// Terminal; memory is about to be released.
    Dead,
}

/// What a shard holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Rx,
    TxOwned,
    TxForeign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// No free buffer available right now; back-pressure, not a fault.
    Exhausted,
    /// The shard is tearing down and no longer hands out buffers.
    ShuttingDown,
    /// A buffer was presented in a state the operation does not accept.
    BadState(BufferState),
    /// Copying a packet that does not fit the buffer.
    TooLong { len: usize, capacity: usize },
    Dma(DmaError),
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BufferError::Exhausted => write!(f, "no free buffers in shard"),
            BufferError::ShuttingDown => write!(f, "buffer shard is shutting down"),
            BufferError::BadState(s) => write!(f, "buffer in unexpected state {s:?}"),
            BufferError::TooLong { len, capacity } => {
                write!(f, "packet of {len} bytes does not fit buffer of {capacity}")
            }
            BufferError::Dma(e) => write!(f, "buffer memory allocation failed: {e}"),
        }
    }
}

impl std::error::Error for BufferError {}

impl From<DmaError> for BufferError {
    fn from(e: DmaError) -> Self {
        BufferError::Dma(e)
    }
}

/// A packet data buffer.
///
/// Owned buffers carry their own [`DmaRegion`]; foreign buffers carry only
/// the device address of producer memory bound for one send. Ownership of the
/// `Buffer` value itself moves between the shard free list, a work queue
/// slot, and a [`LoanedBuffer`]; it is never shared.
pub struct Buffer {
    kind: ShardKind,
    state: BufferState,
    region: Option<DmaRegion>,
    /// Device address of bound producer memory (foreign buffers only).
    bound_addr: u64,
    bound_len: usize,
    /// Valid data length within the buffer.
    len: usize,
    /// Stamped when the buffer is placed on a work queue, so completions can
    /// find it again without looking at descriptor contents.
    wqe_index: Option<u32>,
    shard: Weak<ShardInner>,
    /// Further segments of a multi-segment TX packet (head only).
    chain: Vec<Buffer>,
    /// Fired once when the head of a chain is released (head only).
    on_release: Option<PacketCallback>,
}

impl Buffer {
    fn new(kind: ShardKind, region: Option<DmaRegion>, shard: Weak<ShardInner>) -> Buffer {
        Buffer {
            kind,
            state: BufferState::Created,
            region,
            bound_addr: 0,
            bound_len: 0,
            len: 0,
            wqe_index: None,
            shard,
            chain: Vec::new(),
            on_release: None,
        }
    }

    pub fn kind(&self) -> ShardKind {
        self.kind
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// The address the device should scatter/gather through for this buffer.
    pub fn device_addr(&self) -> u64 {
        match &self.region {
            Some(r) => r.device_addr(),
            None => self.bound_addr,
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.region {
            Some(r) => r.len(),
            None => self.bound_len,
        }
    }

    /// Valid data length (set by a copy in, a foreign bind, or an RX
    /// completion).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn wqe_index(&self) -> Option<u32> {
        self.wqe_index
    }

    pub fn set_wqe_index(&mut self, index: u32) {
        self.wqe_index = Some(index);
    }

    /// Records the data length an RX completion reported.
    pub fn set_len(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.capacity() {
            return Err(BufferError::TooLong { len, capacity: self.capacity() });
        }
        self.len = len;
        Ok(())
    }

    /// Copies packet bytes into an owned buffer.
    pub fn write_packet(&mut self, data: &[u8]) -> Result<(), BufferError> {
        let region = match self.region.as_mut() {
            Some(r) => r,
            None => return Err(BufferError::BadState(self.state)),
        };
        if data.len() > region.len() {
            return Err(BufferError::TooLong { len: data.len(), capacity: region.len() });
        }
        region.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Binds producer memory to a foreign buffer for the duration of one
    /// send.
    pub fn bind_foreign(&mut self, device_addr: u64, len: usize) -> Result<(), BufferError> {
        if self.kind != ShardKind::TxForeign {
            return Err(BufferError::BadState(self.state));
        }
        self.bound_addr = device_addr;
        self.bound_len = len;
        self.len = len;
        Ok(())
    }

    /// The valid bytes of an owned buffer.
    pub fn data(&self) -> &[u8] {
        match &self.region {
            Some(r) => &r.as_slice()[..self.len],
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.region.as_mut() {
            Some(r) => r.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Appends a further segment to this (head) buffer's TX chain.
    pub fn chain_segment(&mut self, seg: Buffer) {
        self.chain.push(seg);
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Every (addr, len) the descriptor's gather list should carry, head
    /// first.
    pub fn gather_list(&self) -> Vec<(u64, usize)> {
        let mut v = Vec::with_capacity(1 + self.chain.len());
        v.push((self.device_addr(), self.len));
        for seg in &self.chain {
            v.push((seg.device_addr(), seg.len));
        }
        v
    }

    /// Installs the callback fired when this head buffer is released.
    pub fn set_release_callback(&mut self, cb: PacketCallback) {
        self.on_release = Some(cb);
    }

    /// Converts an on-queue buffer into a consumer loan. The loan returns
    /// the buffer to its shard when dropped.
    pub fn into_loan(mut self) -> Result<LoanedBuffer, BufferError> {
        if self.state != BufferState::OnWq {
            return Err(BufferError::BadState(self.state));
        }
        self.state = BufferState::Loaned;
        Ok(LoanedBuffer { buf: Some(self) })
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("len", &self.len)
            .field("wqe_index", &self.wqe_index)
            .field("chain", &self.chain.len())
            .finish()
    }
}

/// A buffer on loan to the consumer above the driver. Dereferences to the
/// received bytes; dropping it hands the buffer back to its shard.
pub struct LoanedBuffer {
    buf: Option<Buffer>,
}

impl LoanedBuffer {
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Buffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::ops::Deref for LoanedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().map_or(&[], Buffer::data)
    }
}

impl Drop for LoanedBuffer {
    fn drop(&mut self) {
        let buf = match self.buf.take() {
            Some(b) => b,
            None => return,
        };
        match buf.shard.upgrade() {
            Some(inner) => {
                if let Err(e) = ShardInner::release(&inner, buf) {
                    error!("couldn't return loaned buffer to its shard: {e}");
                }
            }
            // The shard drains its busy count before it goes away, so this
            // would mean someone force-dropped the pool with loans out.
            None => error!("loaned buffer outlived its shard; memory dropped"),
        }
    }
}

struct ShardLists {
    free: Vec<Buffer>,
    /// Buffers currently on a work queue or on loan (chain members counted
    /// individually).
    nbusy: usize,
    shutdown: bool,
}

struct ShardInner {
    kind: ShardKind,
    lists: Mutex<ShardLists>,
    /// Signalled whenever the busy count returns to zero.
    drained: Condvar,
}

impl ShardInner {
    /// Returns one buffer (not its chain) to the free list.
    fn release_single(&self, mut buf: Buffer) -> Result<(), BufferError> {
        match buf.state {
            BufferState::OnWq | BufferState::Loaned => {}
            other => return Err(BufferError::BadState(other)),
        }
        buf.state = BufferState::Free;
        buf.len = 0;
        buf.wqe_index = None;
        buf.bound_addr = 0;
        buf.bound_len = 0;

        let mut lists = self.lists.lock().expect("buffer shard poisoned");
        debug_assert!(lists.nbusy > 0, "buffer released to shard with no busy buffers");
        lists.free.push(buf);
        lists.nbusy -= 1;
        if lists.nbusy == 0 {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Returns a buffer and its whole chain, each member to its own shard,
    /// then fires the head's release callback.
    fn release(self_: &Arc<ShardInner>, mut buf: Buffer) -> Result<(), BufferError> {
        let chain = core::mem::take(&mut buf.chain);
        let cb = buf.on_release.take();

        self_.release_single(buf)?;
        for seg in chain {
            match seg.shard.upgrade() {
                Some(inner) => inner.release_single(seg)?,
                None => {
                    error!("chain segment outlived its shard; memory dropped");
                }
            }
        }

        if let Some(cb) = cb {
            cb();
        }
        Ok(())
    }
}

/// Returns a buffer (and its chain) to the shard it was taken from, without
/// the caller needing to hold a handle to that shard. Completion paths use
/// this so a chain head from one shard is never pushed onto another's free
/// list.
pub fn return_buffer(buf: Buffer) -> Result<(), BufferError> {
    match buf.shard.upgrade() {
        Some(inner) => ShardInner::release(&inner, buf),
        None => {
            error!("buffer returned after its shard was dropped; memory dropped");
            Err(BufferError::ShuttingDown)
        }
    }
}

/// A lock-protected free/busy pool of buffers of one kind.
///
/// Cloning the handle shares the shard.
#[derive(Clone)]
pub struct BufferShard {
    inner: Arc<ShardInner>,
}

impl BufferShard {
    pub fn new(kind: ShardKind) -> BufferShard {
        BufferShard {
            inner: Arc::new(ShardInner {
                kind,
                lists: Mutex::new(ShardLists { free: Vec::new(), nbusy: 0, shutdown: false }),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn kind(&self) -> ShardKind {
        self.inner.kind
    }

    /// Creates `count` buffers and places them on the free list. Owned
    /// shards allocate `buf_size` bytes of DMA memory per buffer; foreign
    /// shards create region-less buffers that only track a binding.
    pub fn provision(
        &self,
        count: usize,
        buf_size: usize,
        dma: &dyn DmaAllocator,
    ) -> Result<(), BufferError> {
        let weak = Arc::downgrade(&self.inner);
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let region = match self.inner.kind {
                ShardKind::TxForeign => None,
                _ => Some(dma.allocate(buf_size, 64)?),
            };
            let mut buf = Buffer::new(self.inner.kind, region, weak.clone());
            buf.state = BufferState::Free;
            created.push(buf);
        }

        let mut lists = self.inner.lists.lock().expect("buffer shard poisoned");
        if lists.shutdown {
            return Err(BufferError::ShuttingDown);
        }
        lists.free.append(&mut created);
        Ok(())
    }

    /// Takes one buffer off the free list and marks it on-queue.
    ///
    /// Exhaustion comes back immediately as an error: back-pressure is the
    /// caller's to handle, never absorbed by blocking here.
    pub fn take(&self) -> Result<Buffer, BufferError> {
        let mut lists = self.inner.lists.lock().expect("buffer shard poisoned");
        if lists.shutdown {
            return Err(BufferError::ShuttingDown);
        }
        let mut buf = lists.free.pop().ok_or(BufferError::Exhausted)?;
        assert_eq!(buf.state, BufferState::Free, "non-free buffer on shard free list");
        buf.state = BufferState::OnWq;
        lists.nbusy += 1;
        Ok(buf)
    }

    /// Returns an on-queue or loaned buffer (and its chain) to the pool.
    ///
    /// A buffer in any other state is rejected; since every legitimate path
    /// holds only on-queue or loaned buffers, a rejection means the caller's
    /// bookkeeping is wrong and the buffer is dropped rather than pooled.
    pub fn release(&self, buf: Buffer) -> Result<(), BufferError> {
        ShardInner::release(&self.inner, buf)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lists.lock().expect("buffer shard poisoned").free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.inner.lists.lock().expect("buffer shard poisoned").nbusy
    }

    /// Tears the shard down: refuses new takes, blocks until every busy
    /// buffer has been released, then destroys the free list.
    ///
    /// Buffers can never be force-freed while a consumer or an outstanding
    /// descriptor might still reference them, which is why this waits rather
    /// than walking the busy set.
    pub fn shutdown(&self) {
        let mut lists = self.inner.lists.lock().expect("buffer shard poisoned");
        lists.shutdown = true;
        while lists.nbusy > 0 {
            lists = self.inner.drained.wait(lists).expect("buffer shard poisoned");
        }
        for mut buf in lists.free.drain(..) {
            assert_eq!(
                buf.state,
                BufferState::Free,
                "tearing down a buffer that is not on the free list"
            );
            buf.state = BufferState::Dead;
            drop(buf);
        }
        trace!("buffer shard ({:?}) drained and destroyed", self.inner.kind);
    }
}

impl fmt::Debug for BufferShard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let lists = self.inner.lists.lock().expect("buffer shard poisoned");
        f.debug_struct("BufferShard")
            .field("kind", &self.inner.kind)
            .field("free", &lists.free.len())
            .field("busy", &lists.nbusy)
            .field("shutdown", &lists.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod test;
