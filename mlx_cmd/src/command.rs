//! The commands themselves, with their typed parameters and outputs.

use crate::CommandOpcode;

/// Page request type used with [`Command::QueryPages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequestType {
    BootPages,
    InitPages,
    RegularPages,
}

/// Placement and sizing parameters shared by every queue-creation command:
/// where the ring lives, how many entries it has, and where the doorbell
/// record is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueContext {
    pub ring_addr: u64,
    pub nents: u32,
    pub doorbell_addr: u64,
    pub uar: u32,
}

/// Event queue creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqContext {
    pub queue: QueueContext,
    /// Bitmask of event types this EQ is subscribed to.
    pub events: u64,
    /// The interrupt vector this EQ reports to.
    pub intr_vector: u32,
}

/// Work queue state, used with ModifySq/ModifyRq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqState {
    Reset,
    Ready,
    Error,
}

/// Hardware-reported event queue state, output of [`Command::QueryEq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqState {
    pub ok: bool,
    pub consumer_counter: u32,
    pub producer_counter: u32,
}

/// Snapshot of the hardware capabilities this driver core cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcaCaps {
    pub num_ports: u8,
    pub log_pg_sz: u8,
    pub cqe_version: u8,
    pub max_tir: u32,
    pub max_rqt_size: u32,
    /// log2 of the largest RX flow table the hardware will create.
    pub max_rx_ft_shift: u8,
    /// Total RX flow entries the hardware supports across all tables.
    pub max_rx_flows: u32,
    /// Longest destination fan-out list a single flow entry may carry.
    pub max_fe_dest: u32,
}

/// NIC vport state, output of [`Command::QueryNicVportContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VportContext {
    pub mac_address: [u8; 6],
    pub mtu: u32,
}

/// One destination in a flow entry's fan-out list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDest {
    /// Forward to another flow table (by table id).
    FlowTable(u32),
    /// Forward to a TIR for hashing/steering into receive queues.
    Tir(u32),
}

/// VLAN match criteria within a [`FlowSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanMatch {
    /// Match tagged (C-VLAN) or untagged frames.
    pub tagged: bool,
    pub vid: u16,
}

/// Match criteria plus destination list for one flow table entry.
///
/// Fields left as `None` are wildcards. The entry's flow-group mask decides
/// which fields the hardware actually compares; entries must only set fields
/// their group's mask covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowSpec {
    pub dmac: Option<[u8; 6]>,
    pub vlan: Option<VlanMatch>,
    pub ethertype: Option<u16>,
    pub ip_proto: Option<u8>,
    pub dests: Vec<FlowDest>,
}

/// One control order to the hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    EnableHca,
    DisableHca,
    InitHca,
    TeardownHca,
    SetDriverVersion(String),
    QueryHcaCap,
    QueryPages(PageRequestType),
    /// Give pages to the hardware (device addresses).
    GivePages(Vec<u64>),
    /// Ask the hardware to return up to `count` pages.
    ReclaimPages { count: u32 },
    QueryNicVportContext { vport: u8 },
    ModifyNicVportContext { vport: u8, promisc: bool },
    AllocUar,
    DeallocUar { uar: u32 },
    AllocPd,
    DeallocPd { pd: u32 },
    AllocTransportDomain,
    DeallocTransportDomain { td: u32 },
    ConfigIntModeration { intr_vector: u32, period_usec: u32 },
    CreateEq(EqContext),
    DestroyEq { eqn: u32 },
    QueryEq { eqn: u32 },
    /// Create a completion queue on the given event queue, with completion
    /// moderation of up to `mod_count` entries or `mod_period_usec`.
    CreateCq { queue: QueueContext, eqn: u32, mod_period_usec: u16, mod_count: u16 },
    DestroyCq { cqn: u32 },
    CreateTis { td: u32 },
    DestroyTis { tisn: u32 },
    CreateSq { queue: QueueContext, cqn: u32, tisn: u32, pd: u32 },
    ModifySq { sqn: u32, state: WqState },
    DestroySq { sqn: u32 },
    CreateRq { queue: QueueContext, cqn: u32, pd: u32 },
    ModifyRq { rqn: u32, state: WqState },
    DestroyRq { rqn: u32 },
    /// Create a TIR hashing on the given L3/L4 selector over an RQT, or
    /// steering directly to a single RQ when `rqt` is `None`.
    CreateTir { td: u32, rqt: Option<u32>, rqn: Option<u32>, hash_selector: u8 },
    DestroyTir { tirn: u32 },
    CreateRqt { rqns: Vec<u32> },
    DestroyRqt { rqtn: u32 },
    CreateFlowTable { level: u32, nents: u32 },
    DestroyFlowTable { table: u32 },
    SetFlowTableRoot { table: u32 },
    /// Reserve a contiguous [start, end] slot range sharing one match mask.
    CreateFlowGroup { table: u32, start: u32, end: u32, mask: FlowSpec },
    DestroyFlowGroup { table: u32, group: u32 },
    SetFlowTableEntry { table: u32, index: u32, group: u32, spec: FlowSpec },
    DeleteFlowTableEntry { table: u32, index: u32 },
}

impl Command {
    pub fn opcode(&self) -> CommandOpcode {
        match self {
            Command::EnableHca => CommandOpcode::EnableHca,
            Command::DisableHca => CommandOpcode::DisableHca,
            Command::InitHca => CommandOpcode::InitHca,
            Command::TeardownHca => CommandOpcode::TeardownHca,
            Command::SetDriverVersion(_) => CommandOpcode::SetDriverVersion,
            Command::QueryHcaCap => CommandOpcode::QueryHcaCap,
            Command::QueryPages(_) => CommandOpcode::QueryPages,
            Command::GivePages(_) | Command::ReclaimPages { .. } => CommandOpcode::ManagePages,
            Command::QueryNicVportContext { .. } => CommandOpcode::QueryNicVportContext,
            Command::ModifyNicVportContext { .. } => CommandOpcode::ModifyNicVportContext,
            Command::AllocUar => CommandOpcode::AllocUar,
            Command::DeallocUar { .. } => CommandOpcode::DeallocUar,
            Command::AllocPd => CommandOpcode::AllocPd,
            Command::DeallocPd { .. } => CommandOpcode::DeallocPd,
            Command::AllocTransportDomain => CommandOpcode::AllocTransportDomain,
            Command::DeallocTransportDomain { .. } => CommandOpcode::DeallocTransportDomain,
            Command::ConfigIntModeration { .. } => CommandOpcode::ConfigIntModeration,
            Command::CreateEq(_) => CommandOpcode::CreateEq,
            Command::DestroyEq { .. } => CommandOpcode::DestroyEq,
            Command::QueryEq { .. } => CommandOpcode::QueryEq,
            Command::CreateCq { .. } => CommandOpcode::CreateCq,
            Command::DestroyCq { .. } => CommandOpcode::DestroyCq,
            Command::CreateTis { .. } => CommandOpcode::CreateTis,
            Command::DestroyTis { .. } => CommandOpcode::DestroyTis,
            Command::CreateSq { .. } => CommandOpcode::CreateSq,
            Command::ModifySq { .. } => CommandOpcode::ModifySq,
            Command::DestroySq { .. } => CommandOpcode::DestroySq,
            Command::CreateRq { .. } => CommandOpcode::CreateRq,
            Command::ModifyRq { .. } => CommandOpcode::ModifyRq,
            Command::DestroyRq { .. } => CommandOpcode::DestroyRq,
            Command::CreateTir { .. } => CommandOpcode::CreateTir,
            Command::DestroyTir { .. } => CommandOpcode::DestroyTir,
            Command::CreateRqt { .. } => CommandOpcode::CreateRqt,
            Command::DestroyRqt { .. } => CommandOpcode::DestroyRqt,
            Command::CreateFlowTable { .. } => CommandOpcode::CreateFlowTable,
            Command::DestroyFlowTable { .. } => CommandOpcode::DestroyFlowTable,
            Command::SetFlowTableRoot { .. } => CommandOpcode::SetFlowTableRoot,
            Command::CreateFlowGroup { .. } => CommandOpcode::CreateFlowGroup,
            Command::DestroyFlowGroup { .. } => CommandOpcode::DestroyFlowGroup,
            Command::SetFlowTableEntry { .. } => CommandOpcode::SetFlowTableEntry,
            Command::DeleteFlowTableEntry { .. } => CommandOpcode::DeleteFlowTableEntry,
        }
    }
}

/// What a completed command handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Status only.
    Done,
    /// A single object number (EQN, CQN, SQN, PD, UAR, table id, ...).
    Number(u32),
    /// How many pages the hardware wants, signed: negative means it is
    /// offering pages back.
    PageCount(i32),
    /// Device addresses of pages the hardware returned.
    Pages(Vec<u64>),
    Caps(HcaCaps),
    Vport(VportContext),
    EqState(EqState),
}
