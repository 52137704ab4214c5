//! Driver core for ConnectX-family NICs: queue lifecycle, flow
//! classification, and ring groups.
//!
//! The driver brings hardware up bottom-up, dependencies first: firmware
//! pages and capabilities, then the domain objects (UAR, PD, transport
//! domain), then the control event queue, the port's root classification
//! table, the completion event queues, and finally the rings and ring
//! groups. Every completed stage is recorded on an ordered list, and
//! teardown unwinds exactly the recorded stages in reverse, so a failure at
//! any point during bring-up releases precisely what was built and nothing
//! else. Re-running teardown on an already-unwound driver is a no-op.
//!
//! Talking to the hardware happens through two collaborator seams: a
//! [`mlx_cmd::CommandInterface`] carrying the firmware command transport,
//! and a [`nic_dma::DmaAllocator`] providing device-visible memory. The
//! driver core owns everything in between.

#[macro_use]
extern crate log;

pub mod completion_queue;
pub mod config;
pub mod error;
pub mod event_queue;
pub mod flow_table;
pub mod pages;
pub mod port;
pub mod ring_group;
pub mod work_queue;

#[cfg(test)]
mod sim;
#[cfg(test)]
mod test;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlx_cmd::{Command, CommandGateway, CommandInterface, CommandOutput, HcaCaps, PageRequestType};
use nic_buffers::LoanedBuffer;
use nic_dma::DmaAllocator;

use completion_queue::CompletionQueue;
use config::DriverConfig;
use error::{Error, Result};
use event_queue::{CompletionVector, EventClass, EventQueue, QueueState};
use pages::PageBank;
use port::Port;
use ring_group::{RxGroup, TxGroup};
use work_queue::{Ring, RingMap, WorkQueue};

/// Delivered receive packets go here; the consumer returns each loan by
/// dropping it.
pub type RxSink = Arc<dyn Fn(LoanedBuffer) + Send + Sync>;

/// One completed step of bring-up. Unwound in reverse order on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    /// Hardware enabled (EnableHca).
    Enabled,
    /// Boot-stage pages handed over.
    BootPages,
    /// Init-stage pages handed over.
    InitPages,
    /// Firmware initialized (InitHca).
    InitHca,
    Uar,
    Pd,
    TransportDomain,
    /// Control event queue up, health check running.
    ControlEq,
    /// Port root classification table installed.
    Port,
    /// Completion event queues and their vector workers up.
    CompletionEqs,
    /// Transport interface object for the send side.
    TxTis,
    /// Completion queues, work queues, and their buffer shards.
    Rings,
    /// RX classification sub-trees and group wiring.
    RingGroups,
}

/// The driver instance for one adapter.
pub struct ConnectX {
    config: DriverConfig,
    gw: Arc<CommandGateway>,
    dma: Arc<dyn DmaAllocator>,
    rx_sink: RxSink,

    stages: Vec<AttachStage>,
    caps: Option<HcaCaps>,
    pages: PageBank,
    uar: Option<u32>,
    pd: Option<u32>,
    td: Option<u32>,
    tisn: Option<u32>,

    eq0: Option<EventQueue>,
    eqs: Vec<EventQueue>,
    vectors: Vec<CompletionVector>,
    port: Option<Port>,

    /// Every ring, in creation order. The map shares the same rings with
    /// the completion vectors, keyed by CQN.
    rings: Vec<Arc<Mutex<Ring>>>,
    ring_map: RingMap,
    rx_rings: Vec<Vec<Arc<Mutex<Ring>>>>,
    tx_rings: Vec<Arc<Mutex<Ring>>>,

    rx_groups: Vec<RxGroup>,
    tx_group: Option<TxGroup>,
    started: bool,
}

impl ConnectX {
    /// Brings the adapter up. On failure everything already built is torn
    /// back down before the error is returned.
    pub fn attach(
        config: DriverConfig,
        transport: Box<dyn CommandInterface>,
        cmd_timeout: Duration,
        dma: Arc<dyn DmaAllocator>,
        rx_sink: RxSink,
    ) -> Result<ConnectX> {
        let mut dev = ConnectX {
            config,
            gw: Arc::new(CommandGateway::new(transport, cmd_timeout)),
            dma,
            rx_sink,
            stages: Vec::new(),
            caps: None,
            pages: PageBank::new(12),
            uar: None,
            pd: None,
            td: None,
            tisn: None,
            eq0: None,
            eqs: Vec::new(),
            vectors: Vec::new(),
            port: None,
            rings: Vec::new(),
            ring_map: Arc::new(Mutex::new(BTreeMap::new())),
            rx_rings: Vec::new(),
            tx_rings: Vec::new(),
            rx_groups: Vec::new(),
            tx_group: None,
            started: false,
        };
        match dev.attach_impl() {
            Ok(()) => Ok(dev),
            Err(e) => {
                error!("attach failed at stage {:?}: {e}", dev.stages.last());
                dev.unwind();
                Err(e)
            }
        }
    }

    fn attach_impl(&mut self) -> Result<()> {
        let gw = self.gw.clone();

        gw.done(&Command::EnableHca)?;
        self.stages.push(AttachStage::Enabled);

        self.pages.satisfy(&gw, &*self.dma, PageRequestType::BootPages)?;
        self.stages.push(AttachStage::BootPages);

        let caps = match gw.execute(&Command::QueryHcaCap)? {
            CommandOutput::Caps(caps) => caps,
            _ => return Err(Error::BadQueueState("capability query output")),
        };
        if caps.num_ports < 1 {
            return Err(Error::CapsTooSmall("no ports"));
        }
        self.config.clamp_rx_groups(&caps);
        self.caps = Some(caps);

        self.pages.satisfy(&gw, &*self.dma, PageRequestType::InitPages)?;
        self.stages.push(AttachStage::InitPages);

        gw.done(&Command::InitHca)?;
        self.stages.push(AttachStage::InitHca);

        gw.done(&Command::SetDriverVersion(format!(
            "mlx5,{}",
            env!("CARGO_PKG_VERSION")
        )))?;

        self.uar = Some(gw.number(&Command::AllocUar)?);
        self.stages.push(AttachStage::Uar);
        self.pd = Some(gw.number(&Command::AllocPd)?);
        self.stages.push(AttachStage::Pd);
        self.td = Some(gw.number(&Command::AllocTransportDomain)?);
        self.stages.push(AttachStage::TransportDomain);

        let uar = self.uar.unwrap_or_else(|| panic!("UAR lost between stages"));
        let pd = self.pd.unwrap_or_else(|| panic!("PD lost between stages"));
        let td = self.td.unwrap_or_else(|| panic!("TD lost between stages"));

        // The control queue comes up before anything that can raise control
        // events, so none are ever dropped.
        let mut eq0 = EventQueue::new(0, 0, self.config.eq_nents(), &*self.dma)?;
        eq0.create(&gw, EventClass::control(), uar)?;
        eq0.start_health_check(gw.clone(), self.config.eq_check_period);
        self.eq0 = Some(eq0);
        self.stages.push(AttachStage::ControlEq);

        self.port = Some(Port::setup(&gw, 0, 1 << self.config.ftbl_root_size_shift)?);
        self.stages.push(AttachStage::Port);

        // Partially-built multi-object stages still unwind: the stage tag
        // goes on first and the unwind walks whatever exists.
        self.stages.push(AttachStage::CompletionEqs);
        for i in 1..=self.config.completion_eq_count {
            let mut eq = EventQueue::new(i, i as u32, self.config.eq_nents(), &*self.dma)?;
            eq.create(&gw, EventClass::COMPLETION, uar)?;
            gw.done(&Command::ConfigIntModeration {
                intr_vector: i as u32,
                period_usec: self.config.intrmod_period_usec,
            })?;
            self.eqs.push(eq);
            self.vectors.push(CompletionVector::spawn(
                i,
                self.ring_map.clone(),
                self.rx_sink.clone(),
            )?);
        }
        self.stages.push(AttachStage::TxTis);
        self.tisn = Some(gw.number(&Command::CreateTis { td })?);
        let tisn = self.tisn.unwrap_or_else(|| panic!("TIS lost between stages"));

        self.stages.push(AttachStage::Rings);
        let mut next_eq = 0usize;
        for g in 0..self.config.rx_ngroups() {
            let nrings = if g < self.config.rx_ngroups_large {
                self.config.rx_nrings_per_large_group
            } else {
                self.config.rx_nrings_per_small_group
            };
            let mut group_rings = Vec::with_capacity(nrings);
            for _ in 0..nrings {
                let wq = WorkQueue::new_rq(
                    self.config.rq_nents(),
                    self.config.rx_buffer_size,
                    &*self.dma,
                )?;
                let ring = self.create_ring(&gw, wq, &mut next_eq, uar, pd)?;
                group_rings.push(ring);
            }
            self.rx_rings.push(group_rings);
        }
        for _ in 0..self.config.tx_ngroups * self.config.tx_nrings_per_group {
            let wq = WorkQueue::new_sq(
                self.config.sq_nents(),
                tisn,
                self.config.tx_buffer_size,
                self.config.tx_bind_threshold,
                &*self.dma,
            )?;
            let ring = self.create_ring(&gw, wq, &mut next_eq, uar, pd)?;
            self.tx_rings.push(ring);
        }

        self.stages.push(AttachStage::RingGroups);
        for (g, group_rings) in self.rx_rings.clone().into_iter().enumerate() {
            let rqns: Vec<u32> = group_rings
                .iter()
                .map(|ring| {
                    let ring = ring.lock().expect("ring poisoned");
                    ring.wq.wqn().unwrap_or_else(|| panic!("ring created without a queue number"))
                })
                .collect();
            let group = RxGroup::setup(
                &gw,
                g,
                td,
                &rqns,
                1 << self.config.ftbl_vlan_size_shift,
                group_rings,
            )?;
            let port = self.port.as_ref().unwrap_or_else(|| panic!("port lost between stages"));
            port.register_group(&gw, g, group.vlan_table_id(), group.hash_table_id())?;
            if g == 0 {
                // The port's own MAC lands in the first (default) group.
                port.add_mac(&gw, 0, port.mac_address())?;
            }
            self.rx_groups.push(group);
        }
        self.tx_group = Some(TxGroup::new(0, tisn, self.tx_rings.clone()));

        info!(
            "attach complete: {} RX groups, {} RX rings, {} TX rings, {} completion EQs",
            self.rx_groups.len(),
            self.rx_rings.iter().map(Vec::len).sum::<usize>(),
            self.tx_rings.len(),
            self.eqs.len()
        );
        Ok(())
    }

    /// Creates one CQ/WQ pair, binds the CQ round-robin to the next
    /// completion event queue, and publishes the ring to the vectors.
    fn create_ring(
        &mut self,
        gw: &CommandGateway,
        mut wq: WorkQueue,
        next_eq: &mut usize,
        uar: u32,
        pd: u32,
    ) -> Result<Arc<Mutex<Ring>>> {
        if self.eqs.is_empty() {
            return Err(Error::BadQueueState("no completion event queues"));
        }
        let eq = &self.eqs[*next_eq % self.eqs.len()];
        let eqn = eq.eqn().ok_or(Error::BadQueueState("completion EQ not created"))?;
        *next_eq += 1;

        let mut cq = CompletionQueue::new(self.config.cq_nents(), &*self.dma)?;
        cq.create(
            gw,
            eqn,
            uar,
            self.config.cqemod_period_usec as u16,
            (self.config.cq_nents() / 10) as u16,
        )?;
        let cqn = cq.cqn().ok_or(Error::BadQueueState("completion queue not created"))?;

        if let Err(e) = wq.create(gw, cqn, pd, uar) {
            cq.destroy(gw)
                .unwrap_or_else(|e2| panic!("CQ {cqn} refused destruction: {e2} (after {e})"));
            return Err(e);
        }

        let ring = Arc::new(Mutex::new(Ring { wq, cq }));
        self.rings.push(ring.clone());
        self.ring_map.lock().expect("ring map poisoned").insert(cqn, ring.clone());
        Ok(ring)
    }

    /// Starts every ring group: descriptors ready, receive rings filled.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        for group in &self.rx_groups {
            group.start(&self.gw)?;
        }
        if let Some(tx) = &self.tx_group {
            tx.start(&self.gw)?;
        }
        self.started = true;
        Ok(())
    }

    /// Stops every ring group and returns posted buffers to their shards.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        for group in &self.rx_groups {
            group.stop(&self.gw)?;
        }
        if let Some(tx) = &self.tx_group {
            tx.stop(&self.gw)?;
        }
        self.started = false;
        Ok(())
    }

    pub fn caps(&self) -> Option<&HcaCaps> {
        self.caps.as_ref()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gw
    }

    pub fn stages(&self) -> &[AttachStage] {
        &self.stages
    }

    pub fn port(&self) -> Option<&Port> {
        self.port.as_ref()
    }

    pub fn rx_group(&self, index: usize) -> Option<&RxGroup> {
        self.rx_groups.get(index)
    }

    pub fn rx_group_count(&self) -> usize {
        self.rx_groups.len()
    }

    pub fn tx_group(&self) -> Option<&TxGroup> {
        self.tx_group.as_ref()
    }

    pub fn control_eq(&self) -> Option<&EventQueue> {
        self.eq0.as_ref()
    }

    pub fn completion_eqs(&self) -> &[EventQueue] {
        &self.eqs
    }

    pub fn ring(&self, cqn: u32) -> Option<Arc<Mutex<Ring>>> {
        self.ring_map.lock().expect("ring map poisoned").get(&cqn).cloned()
    }

    /// Interrupt glue entry point: a completion event arrived on the given
    /// vector for the given CQ.
    pub fn notify_completion(&self, vector: usize, cqn: u32) {
        match self.vectors.get(vector.wrapping_sub(1)) {
            Some(v) => v.notify(cqn),
            None => warn!("completion notification for unknown vector {vector}"),
        }
    }

    /// Tears the adapter down. Equivalent to dropping it, but lets the
    /// caller choose the moment; teardown of an already-unwound driver does
    /// nothing.
    pub fn teardown(mut self) {
        self.unwind();
    }

    /// Unwinds recorded stages in reverse. Hardware refusing to destroy an
    /// object it reported creating is unrecoverable and panics; page
    /// reclaim refusals end in a deliberate leak instead.
    fn unwind(&mut self) {
        let gw = self.gw.clone();
        if self.started {
            if let Err(e) = self.stop() {
                error!("stopping rings during teardown failed: {e}");
            }
        }
        while let Some(stage) = self.stages.pop() {
            match stage {
                AttachStage::RingGroups => {
                    self.tx_group = None;
                    for group in self.rx_groups.drain(..).rev() {
                        group.teardown(&gw);
                    }
                }
                AttachStage::Rings => self.unwind_rings(&gw),
                AttachStage::TxTis => {
                    if let Some(tisn) = self.tisn.take() {
                        gw.done(&Command::DestroyTis { tisn })
                            .unwrap_or_else(|e| panic!("TIS {tisn} refused destruction: {e}"));
                    }
                }
                AttachStage::CompletionEqs => {
                    for vector in self.vectors.drain(..) {
                        drop(vector);
                    }
                    for mut eq in self.eqs.drain(..).rev() {
                        if eq.state() == QueueState::Created {
                            eq.destroy(&gw).unwrap_or_else(|e| {
                                panic!("EQ {} refused destruction: {e}", eq.index())
                            });
                        }
                        eq.release();
                    }
                }
                AttachStage::Port => {
                    if let Some(port) = self.port.take() {
                        port.teardown(&gw);
                    }
                }
                AttachStage::ControlEq => {
                    if let Some(mut eq0) = self.eq0.take() {
                        eq0.stop_health_check();
                        if eq0.state() == QueueState::Created {
                            eq0.destroy(&gw)
                                .unwrap_or_else(|e| panic!("control EQ refused destruction: {e}"));
                        }
                        eq0.release();
                    }
                }
                AttachStage::TransportDomain => {
                    if let Some(td) = self.td.take() {
                        gw.done(&Command::DeallocTransportDomain { td })
                            .unwrap_or_else(|e| panic!("TD {td} refused release: {e}"));
                    }
                }
                AttachStage::Pd => {
                    if let Some(pd) = self.pd.take() {
                        gw.done(&Command::DeallocPd { pd })
                            .unwrap_or_else(|e| panic!("PD {pd} refused release: {e}"));
                    }
                }
                AttachStage::Uar => {
                    if let Some(uar) = self.uar.take() {
                        gw.done(&Command::DeallocUar { uar })
                            .unwrap_or_else(|e| panic!("UAR {uar} refused release: {e}"));
                    }
                }
                AttachStage::InitHca => {
                    gw.done(&Command::TeardownHca)
                        .unwrap_or_else(|e| panic!("TeardownHca refused: {e}"));
                }
                AttachStage::InitPages | AttachStage::BootPages => {
                    if let Err(e) = self.pages.reclaim_all(
                        &gw,
                        self.config.reclaim_tries,
                        self.config.reclaim_delay,
                    ) {
                        error!("page reclaim incomplete during teardown: {e}");
                    }
                }
                AttachStage::Enabled => {
                    gw.done(&Command::DisableHca)
                        .unwrap_or_else(|e| panic!("DisableHca refused: {e}"));
                }
            }
        }
    }

    /// Work queues first, then completion queues, then the buffer shards;
    /// a shard only drains once nothing can still post into it.
    fn unwind_rings(&mut self, gw: &CommandGateway) {
        for ring in &self.rings {
            let mut ring = ring.lock().expect("ring poisoned");
            if ring.wq.hw_state() == mlx_cmd::WqState::Ready {
                if let Err(e) = ring.wq.stop(gw) {
                    error!("stopping WQ during teardown failed: {e}");
                }
            }
            if let Err(e) = ring.wq.flush() {
                error!("flushing WQ during teardown failed: {e}");
            }
            if ring.wq.state() == QueueState::Created {
                ring.wq
                    .destroy(gw)
                    .unwrap_or_else(|e| panic!("WQ refused destruction: {e}"));
            }
        }
        for ring in &self.rings {
            let mut ring = ring.lock().expect("ring poisoned");
            if ring.cq.state() == QueueState::Created {
                ring.cq
                    .destroy(gw)
                    .unwrap_or_else(|e| panic!("CQ refused destruction: {e}"));
            }
        }
        for ring in &self.rings {
            let ring = ring.lock().expect("ring poisoned");
            ring.wq.shutdown_pools();
        }
        self.ring_map.lock().expect("ring map poisoned").clear();
        self.rx_rings.clear();
        self.tx_rings.clear();
        self.rings.clear();
    }
}

impl Drop for ConnectX {
    fn drop(&mut self) {
        self.unwind();
    }
}
