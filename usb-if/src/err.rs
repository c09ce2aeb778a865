use num_enum::TryFromPrimitiveError;

use crate::{descriptor::EndpointType, transfer::Direction};

/// Failure reported by a low level collaborator (PHY, clock tree, timer).
///
/// The code is the collaborator's own diagnostic and is passed through untouched.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("low level error code {0:#x}")]
pub struct LowLevelError(pub u32);

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbdError {
    #[error("Null parameter")]
    NullParameter,
    #[error("Already initialized")]
    AlreadyInitialized,
    #[error("Not initialized")]
    Uninitialized,
    #[error("Unsupported speed")]
    Speed,
    #[error("Invalid device address")]
    Address,
    #[error("Endpoint already registered")]
    EndpointAlreadyRegistered,
    #[error("Endpoint not registered")]
    EndpointNotRegistered,
    #[error("Endpoint number out of range")]
    EndpointNumber,
    #[error("No physical endpoint available")]
    EndpointPhysicalIndex,
    #[error("Invalid endpoint transfer type")]
    EndpointTransferType,
    #[error("Invalid endpoint direction")]
    EndpointDirection,
    #[error("Unsupported endpoint buffer mode")]
    EndpointBufferMode,
    #[error("Endpoint RAM allocation too large")]
    RamMallocSize,
    #[error("Endpoint RAM exhausted")]
    RamMalloc,
    #[error("Endpoint RAM free: unknown address")]
    RamFreeAddress,
    #[error("Endpoint RAM free: size mismatch")]
    RamFreeSize,
    #[error("Packet size overflow")]
    PacketSizeOverflow,
    #[error("USB HS PHY error: {0}")]
    Phy(#[source] LowLevelError),
    #[error("SYSCON error: {0}")]
    Syscon(#[source] LowLevelError),
    #[error("SYSTICK error: {0}")]
    Systick(#[source] LowLevelError),
}

impl From<TryFromPrimitiveError<Direction>> for UsbdError {
    fn from(_: TryFromPrimitiveError<Direction>) -> Self {
        UsbdError::EndpointDirection
    }
}

impl From<TryFromPrimitiveError<EndpointType>> for UsbdError {
    fn from(_: TryFromPrimitiveError<EndpointType>) -> Self {
        UsbdError::EndpointTransferType
    }
}
