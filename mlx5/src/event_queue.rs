//! Event queues and the per-vector completion workers.
//!
//! Every interrupt vector owns one event queue. Event queue 0 is the control
//! queue: it alone subscribes to non-completion events (command completions,
//! page requests, port state changes, internal errors) and it is brought up
//! before anything that could generate them. It also carries a periodic
//! health check that re-queries the queue's hardware state; the check must
//! be stopped before the queue's ring memory is released, since the query
//! reads state that describes that ring.
//!
//! Queues 1..n subscribe only to completion notifications. Completion queues
//! are spread across them round-robin at creation time, and each gets a
//! worker thread that drains completions for the rings assigned to it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mlx_cmd::{Command, CommandGateway, EqContext, EqState, QueueContext};
use nic_buffers::LoanedBuffer;
use nic_dma::{DmaAllocator, DmaRegion};

use crate::error::{Error, Result};
use crate::work_queue::RingMap;

/// Size of one hardware event queue entry.
const EQE_SIZE: usize = 64;

/// Lifecycle of a hardware queue object. Later states may only be entered
/// from the immediately preceding one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Ring memory allocated, hardware knows nothing yet.
    Allocated,
    /// Hardware object exists.
    Created,
    /// Hardware object destroyed; memory still held.
    Destroyed,
}

bitflags::bitflags! {
    /// Event types an event queue can subscribe to, one bit per hardware
    /// event type number.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventClass: u64 {
        const COMPLETION = 1 << 0x00;
        const INTERNAL_ERROR = 1 << 0x08;
        const PORT_STATE_CHANGE = 1 << 0x09;
        const CMD_DONE = 1 << 0x0a;
        const PAGE_REQUEST = 1 << 0x0b;
        const TEMP_WARNING = 1 << 0x17;
    }
}

impl EventClass {
    /// The control-plane set carried only by event queue 0.
    pub fn control() -> EventClass {
        EventClass::INTERNAL_ERROR
            | EventClass::PORT_STATE_CHANGE
            | EventClass::CMD_DONE
            | EventClass::PAGE_REQUEST
            | EventClass::TEMP_WARNING
    }
}

/// One hardware event queue and its ring memory.
#[derive(Debug)]
pub struct EventQueue {
    index: usize,
    eqn: Option<u32>,
    state: QueueState,
    events: EventClass,
    intr_vector: u32,
    ring: DmaRegion,
    doorbell: DmaRegion,
    health: Option<HealthCheck>,
}

impl EventQueue {
    /// Allocates ring memory for a queue on the given interrupt vector.
    pub fn new(
        index: usize,
        intr_vector: u32,
        nents: u32,
        dma: &dyn DmaAllocator,
    ) -> Result<EventQueue> {
        let ring = dma.allocate(nents as usize * EQE_SIZE, 4096)?;
        let doorbell = dma.allocate(8, 8)?;
        Ok(EventQueue {
            index,
            eqn: None,
            state: QueueState::Allocated,
            events: EventClass::empty(),
            intr_vector,
            ring,
            doorbell,
            health: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// The hardware queue number; present once created.
    pub fn eqn(&self) -> Option<u32> {
        self.eqn
    }

    pub fn events(&self) -> EventClass {
        self.events
    }

    /// Creates the hardware object, subscribed to the given event classes.
    pub fn create(&mut self, gw: &CommandGateway, events: EventClass, uar: u32) -> Result<()> {
        if self.state != QueueState::Allocated {
            return Err(Error::BadQueueState("event queue create"));
        }
        let nents = (self.ring.len() / EQE_SIZE) as u32;
        let eqn = gw.number(&Command::CreateEq(EqContext {
            queue: QueueContext {
                ring_addr: self.ring.device_addr(),
                nents,
                doorbell_addr: self.doorbell.device_addr(),
                uar,
            },
            events: events.bits(),
            intr_vector: self.intr_vector,
        }))?;
        self.eqn = Some(eqn);
        self.events = events;
        self.state = QueueState::Created;
        debug!("created EQ {eqn} (index {}, vector {})", self.index, self.intr_vector);
        Ok(())
    }

    /// Re-queries the queue's hardware state.
    pub fn query(&self, gw: &CommandGateway) -> Result<EqState> {
        let eqn = self.eqn.ok_or(Error::BadQueueState("event queue query"))?;
        match gw.execute(&Command::QueryEq { eqn })? {
            mlx_cmd::CommandOutput::EqState(s) => Ok(s),
            _ => Err(Error::BadQueueState("event queue query output")),
        }
    }

    /// Starts the periodic health check. Only meaningful on the control
    /// queue, and only while the hardware object exists.
    pub fn start_health_check(&mut self, gw: Arc<CommandGateway>, period: Duration) {
        assert_eq!(
            self.state,
            QueueState::Created,
            "health check started on EQ {} before hardware creation",
            self.index
        );
        if self.health.is_some() {
            return;
        }
        let eqn = match self.eqn {
            Some(eqn) => eqn,
            None => return,
        };
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let index = self.index;
        let thread = thread::Builder::new()
            .name(format!("eq{index}-health"))
            .spawn(move || health_loop(eqn, index, gw, period, stop_rx))
            .ok();
        if let Some(thread) = thread {
            self.health = Some(HealthCheck { stop: stop_tx, thread: Some(thread) });
        } else {
            error!("couldn't spawn health check thread for EQ {index}");
        }
    }

    /// Stops the health check and waits for its thread to exit.
    pub fn stop_health_check(&mut self) {
        if let Some(mut health) = self.health.take() {
            // Dropping the sender also wakes the thread; the explicit send
            // keeps shutdown prompt when the thread is mid-wait.
            let _ = health.stop.send(());
            if let Some(thread) = health.thread.take() {
                let _ = thread.join();
            }
        }
    }

    pub fn health_check_running(&self) -> bool {
        self.health.is_some()
    }

    /// Destroys the hardware object. The ring memory stays allocated until
    /// [`EventQueue::release`].
    pub fn destroy(&mut self, gw: &CommandGateway) -> Result<()> {
        if self.state != QueueState::Created {
            return Err(Error::BadQueueState("event queue destroy"));
        }
        let eqn = self.eqn.take().ok_or(Error::BadQueueState("event queue destroy"))?;
        gw.done(&Command::DestroyEq { eqn })?;
        self.state = QueueState::Destroyed;
        debug!("destroyed EQ {eqn}");
        Ok(())
    }

    /// Releases the queue's ring memory.
    ///
    /// The health check reads this memory's hardware state, so releasing
    /// while it still runs is an ordering bug in the caller, not a condition
    /// to tolerate.
    pub fn release(self) {
        assert!(
            self.health.is_none(),
            "EQ {} memory released with its health check still running",
            self.index
        );
        assert_ne!(
            self.state,
            QueueState::Created,
            "EQ {} memory released while its hardware object exists",
            self.index
        );
        drop(self.ring);
        drop(self.doorbell);
    }
}

#[derive(Debug)]
struct HealthCheck {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

fn health_loop(
    eqn: u32,
    index: usize,
    gw: Arc<CommandGateway>,
    period: Duration,
    stop: Receiver<()>,
) {
    loop {
        match stop.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        match gw.execute(&Command::QueryEq { eqn }) {
            Ok(mlx_cmd::CommandOutput::EqState(state)) => {
                if !state.ok {
                    warn!(
                        "EQ {eqn} (index {index}) unhealthy: consumer {} producer {}",
                        state.consumer_counter, state.producer_counter
                    );
                }
            }
            Ok(_) => warn!("EQ {eqn} health query returned unexpected output"),
            Err(e) => warn!("EQ {eqn} health query failed: {e}"),
        }
    }
}

/// What an interrupt delivery tells a completion vector.
#[derive(Debug)]
pub enum VectorMessage {
    /// A completion queue on this vector has new entries.
    Completion { cqn: u32 },
    Shutdown,
}

/// A completion worker pinned to one event queue vector.
///
/// The worker only drains completions: it locks the ring map, clones the
/// ring handle, drops the map lock, then locks the ring itself. Buffer
/// releases happen inside ring processing through the pool's own locks,
/// which sit below the ring lock in the global order.
pub struct CompletionVector {
    index: usize,
    tx: Sender<VectorMessage>,
    thread: Option<JoinHandle<()>>,
}

impl CompletionVector {
    pub fn spawn(
        index: usize,
        rings: RingMap,
        sink: Arc<dyn Fn(LoanedBuffer) + Send + Sync>,
    ) -> Result<CompletionVector> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(format!("eq{index}-vec"))
            .spawn(move || vector_loop(index, rx, rings, sink))
            .map_err(|_| Error::BadQueueState("completion vector spawn"))?;
        Ok(CompletionVector { index, tx, thread: Some(thread) })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Hands the worker a notification; called from interrupt glue.
    pub fn notify(&self, cqn: u32) {
        if self.tx.send(VectorMessage::Completion { cqn }).is_err() {
            error!("completion vector {} is gone; dropping notification", self.index);
        }
    }

    /// Stops the worker and waits for it to finish its current drain.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(VectorMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CompletionVector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn vector_loop(
    index: usize,
    rx: Receiver<VectorMessage>,
    rings: RingMap,
    sink: Arc<dyn Fn(LoanedBuffer) + Send + Sync>,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            VectorMessage::Shutdown => break,
            VectorMessage::Completion { cqn } => {
                let ring = {
                    let map = rings.lock().expect("ring map poisoned");
                    map.get(&cqn).cloned()
                };
                let ring = match ring {
                    Some(r) => r,
                    None => {
                        warn!("vector {index}: completion for unknown CQ {cqn}");
                        continue;
                    }
                };
                let mut ring = ring.lock().expect("ring poisoned");
                if let Err(e) = ring.process_completions(&mut |loan| sink(loan)) {
                    error!("vector {index}: CQ {cqn} drain failed: {e}");
                }
            }
        }
    }
    trace!("completion vector {index} exiting");
}
