//! Status codes written back by hardware when a command completes.

use num_enum::TryFromPrimitive;

/// Delivery status: whether the command entry itself reached the hardware
/// intact. This says nothing about whether the command succeeded.
/// (PRM Section 23.4.3, Table 1260)
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum CommandDeliveryStatus {
    Success = 0x0,
    SignatureErr = 0x1,
    TokenErr = 0x2,
    BadBlockNumber = 0x3,
    BadOutputPointer = 0x4,
    BadInputPointer = 0x5,
    InternalErr = 0x6,
    InputLenErr = 0x7,
    OutputLenErr = 0x8,
    ReservedNotZero = 0x9,
    BadCommandType = 0x10,
}

/// Return status: the hardware's verdict on the command itself.
/// (PRM Section 23.4.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandReturnStatus {
    Ok = 0x00,
    InternalError = 0x01,
    BadOp = 0x02,
    BadParam = 0x03,
    BadSysState = 0x04,
    BadResource = 0x05,
    ResourceBusy = 0x06,
    ExceedLim = 0x08,
    BadResState = 0x09,
    BadIndex = 0x0A,
    NoResources = 0x0F,
    BadResourceState = 0x10,
    BadPkt = 0x30,
    BadSize = 0x40,
    BadInputLen = 0x50,
    BadOutputLen = 0x51,
}

impl CommandReturnStatus {
    /// Whether a refusal with this status is worth retrying at all.
    /// Resource-busy style refusals can clear; parameter errors never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommandReturnStatus::ResourceBusy | CommandReturnStatus::NoResources
        )
    }
}
