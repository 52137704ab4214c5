//! The typed command interface used to pass control orders from the driver to
//! the NIC ("create this queue", "delete this flow entry", and so on).
//!
//! The command interface is never used to transmit or receive packets; that
//! happens only on queues created through it. Commands here are plain typed
//! values; marshalling them into the wire format a particular hardware
//! generation expects is the transport's job, behind [`CommandInterface`].
//!
//! All information about opcodes and statuses is taken from the Mellanox
//! Adapters Programmer's Reference Manual (PRM).

#[macro_use]
extern crate log;

use core::fmt;
use std::sync::Mutex;
use std::time::Duration;

use num_enum::TryFromPrimitive;

mod command;
mod status;

pub use command::{
    Command, CommandOutput, EqContext, EqState, FlowDest, FlowSpec, HcaCaps, PageRequestType,
    QueueContext, VlanMatch, VportContext, WqState,
};
pub use status::{CommandDeliveryStatus, CommandReturnStatus};

/// Command opcode, as written in the opcode field of a command entry.
/// (PRM Section 23.3.2, Table 1173)
#[derive(PartialEq, Eq, Debug, TryFromPrimitive, Copy, Clone, Hash)]
#[repr(u32)]
pub enum CommandOpcode {
    QueryHcaCap = 0x100,
    InitHca = 0x102,
    TeardownHca = 0x103,
    EnableHca = 0x104,
    DisableHca = 0x105,
    QueryPages = 0x107,
    ManagePages = 0x108,
    SetDriverVersion = 0x10D,
    CreateEq = 0x301,
    DestroyEq = 0x302,
    QueryEq = 0x303,
    CreateCq = 0x400,
    DestroyCq = 0x401,
    QueryNicVportContext = 0x754,
    ModifyNicVportContext = 0x755,
    AllocPd = 0x800,
    DeallocPd = 0x801,
    AllocUar = 0x802,
    DeallocUar = 0x803,
    ConfigIntModeration = 0x804,
    AllocTransportDomain = 0x816,
    DeallocTransportDomain = 0x817,
    CreateTir = 0x900,
    DestroyTir = 0x902,
    CreateSq = 0x904,
    ModifySq = 0x905,
    DestroySq = 0x906,
    CreateRq = 0x908,
    ModifyRq = 0x909,
    DestroyRq = 0x90A,
    CreateTis = 0x912,
    DestroyTis = 0x913,
    CreateRqt = 0x916,
    DestroyRqt = 0x918,
    SetFlowTableRoot = 0x92F,
    CreateFlowTable = 0x930,
    DestroyFlowTable = 0x931,
    CreateFlowGroup = 0x933,
    DestroyFlowGroup = 0x934,
    SetFlowTableEntry = 0x936,
    DeleteFlowTableEntry = 0x938,
}

/// Possible reasons for failure when executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command never reached the hardware intact.
    Delivery(CommandDeliveryStatus),
    /// The hardware executed the command and refused it.
    Returned(CommandReturnStatus),
    /// The transport does not implement this opcode.
    Unsupported(CommandOpcode),
    /// The command completed but its output was not the shape the caller
    /// asked for.
    BadOutput(CommandOpcode),
    /// No completion arrived within the gateway's timeout.
    Timeout(CommandOpcode),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::Delivery(s) => write!(f, "command delivery failed: {s:?}"),
            CommandError::Returned(s) => write!(f, "command refused by hardware: {s:?}"),
            CommandError::Unsupported(op) => write!(f, "opcode {op:?} not supported by transport"),
            CommandError::BadOutput(op) => write!(f, "unexpected output shape for {op:?}"),
            CommandError::Timeout(op) => write!(f, "no completion for {op:?} within timeout"),
        }
    }
}

impl std::error::Error for CommandError {}

/// The transport that actually carries commands to firmware.
///
/// `execute` is synchronous and blocking: it returns once the command has
/// completed (or failed), and implementations may assume there is never more
/// than one outstanding command. Failures come back as statuses; this call
/// must not panic on hardware refusal.
pub trait CommandInterface: Send {
    fn execute(
        &mut self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// Serializes all command traffic onto one [`CommandInterface`].
///
/// Every hardware-object create/destroy/modify in the driver goes through a
/// single gateway, so command issuance is fully ordered. That ordering is
/// what lets flow-table and queue-lifecycle code on different locks agree on
/// what the hardware has actually seen.
pub struct CommandGateway {
    transport: Mutex<Box<dyn CommandInterface>>,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(transport: Box<dyn CommandInterface>, timeout: Duration) -> CommandGateway {
        CommandGateway { transport: Mutex::new(transport), timeout }
    }

    /// Executes one command and waits for its completion.
    pub fn execute(&self, cmd: &Command) -> Result<CommandOutput, CommandError> {
        let mut transport = self.transport.lock().expect("command transport poisoned");
        let res = transport.execute(cmd, self.timeout);
        if let Err(ref e) = res {
            debug!("command {:?} failed: {}", cmd.opcode(), e);
        }
        res
    }

    /// Executes a command whose only interesting output is a single object
    /// number (EQN, CQN, PD, table id, ...).
    pub fn number(&self, cmd: &Command) -> Result<u32, CommandError> {
        match self.execute(cmd)? {
            CommandOutput::Number(n) => Ok(n),
            _ => Err(CommandError::BadOutput(cmd.opcode())),
        }
    }

    /// Executes a command that produces no output beyond its status.
    pub fn done(&self, cmd: &Command) -> Result<(), CommandError> {
        match self.execute(cmd)? {
            CommandOutput::Done => Ok(()),
            _ => Err(CommandError::BadOutput(cmd.opcode())),
        }
    }
}

impl fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandGateway").field("timeout", &self.timeout).finish()
    }
}
