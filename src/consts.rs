//! Controller constants for the LPC55-class USB1 high-speed device block.

/// Number of logical endpoints, including control.
pub const NUM_ENDPOINTS: usize = 1 + 5;

pub const USB1_BASE: usize = 0x4009_4000;
pub const USB1_SRAM_ADDR: usize = 0x4010_0000;
pub const USB1_SRAM_SIZE: usize = 0x4000;

/// One command/status word per buffer, two buffers per physical endpoint.
pub const EP_LIST_ENTRY_SIZE: usize = 4;
pub const BUFFERS_PER_PHYSICAL_EP: usize = 2;

/// Packet buffers are addressed in 64 byte units (`AddrOff`).
pub const BUFFER_ALIGN: usize = 64;
/// `AddrOff` is 11 bits wide.
pub const BUFFER_ADDRESS_RANGE: usize = (1 << 11) * BUFFER_ALIGN;
/// `NBytes` is 15 bits wide on the high-speed block.
pub const NBYTES_MAX: usize = (1 << 15) - 1;

pub const SETUP_PACKET_SIZE: usize = 8;
pub const EP0_MAX_PACKET_SIZE: u16 = 64;
pub const MAX_DEVICE_ADDRESS: u8 = 0x7f;

/// Time given to the PHY to settle after power up.
pub const PHY_SETTLE_MS: u64 = 10;

pub const fn ep_list_size(num_endpoints: usize) -> usize {
    num_endpoints * 2 * BUFFERS_PER_PHYSICAL_EP * EP_LIST_ENTRY_SIZE
}

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
