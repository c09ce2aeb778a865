#![cfg_attr(not(test), no_std)]

pub mod descriptor;
pub mod err;
pub mod transfer;

/// Bus speed negotiated by the controller.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSpeed {
    Low,
    Full,
    #[default]
    High,
}

impl DeviceSpeed {
    /// Largest `wMaxPacketSize` allowed for the control endpoint at this speed.
    pub const fn control_max_packet_size(self) -> u16 {
        match self {
            DeviceSpeed::Low => 8,
            DeviceSpeed::Full | DeviceSpeed::High => 64,
        }
    }
}

/// Lifecycle of the device controller.
///
/// `Addressed` is only entered once the status stage of the control transfer
/// carrying `SET_ADDRESS` has completed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Uninitialized,
    Initialized,
    Started,
    Addressed(u8),
}

impl DeviceState {
    pub fn is_initialized(&self) -> bool {
        !matches!(self, DeviceState::Uninitialized)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DeviceState::Started | DeviceState::Addressed(_))
    }
}
