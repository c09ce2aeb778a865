//! USB1 high-speed device register block and endpoint command/status list.

use core::ptr::NonNull;

use tock_registers::{
    LocalRegisterCopy, RegisterLongName,
    fields::FieldValue,
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::{ReadOnly, ReadWrite},
};
use usb_if::transfer::Direction;

use crate::{
    Mmio,
    consts::{BUFFER_ALIGN, BUFFERS_PER_PHYSICAL_EP, EP_LIST_ENTRY_SIZE, ep_list_size},
};

#[repr(C)]
pub struct UsbhsRegisters {
    /// 0x00 - Device command/status
    pub devcmdstat: ReadWrite<u32, DEVCMDSTAT::Register>,
    /// 0x04 - Frame number and error status
    pub info: ReadOnly<u32, INFO::Register>,
    /// 0x08 - Endpoint command/status list start
    pub epliststart: ReadWrite<u32>,
    /// 0x0c - Data buffer start
    pub databufstart: ReadWrite<u32>,
    /// 0x10 - Link power management
    pub lpm: ReadWrite<u32>,
    /// 0x14 - Endpoint skip
    pub epskip: ReadWrite<u32>,
    /// 0x18 - Buffer in use (double buffered endpoints)
    pub epinuse: ReadWrite<u32>,
    /// 0x1c - Endpoint buffer configuration
    pub epbufcfg: ReadWrite<u32>,
    /// 0x20 - Interrupt status, write 1 to clear
    pub intstat: ReadWrite<u32, INT::Register>,
    /// 0x24 - Interrupt enable
    pub inten: ReadWrite<u32, INT::Register>,
    /// 0x28 - Set interrupt status
    pub intsetstat: ReadWrite<u32, INT::Register>,
    _reserved0: [u32; 2],
    /// 0x34 - Endpoint toggle
    pub eptoggle: ReadOnly<u32>,
}

register_bitfields![u32,
    pub DEVCMDSTAT [
        DEV_ADDR OFFSET(0) NUMBITS(7) [],
        DEV_EN OFFSET(7) NUMBITS(1) [],
        /// Set by hardware when a SETUP token was received, write 1 to clear
        SETUP OFFSET(8) NUMBITS(1) [],
        FORCE_NEEDCLK OFFSET(9) NUMBITS(1) [],
        LPM_SUP OFFSET(11) NUMBITS(1) [],
        INTONNAK_AO OFFSET(12) NUMBITS(1) [],
        INTONNAK_AI OFFSET(13) NUMBITS(1) [],
        INTONNAK_CO OFFSET(14) NUMBITS(1) [],
        INTONNAK_CI OFFSET(15) NUMBITS(1) [],
        DCON OFFSET(16) NUMBITS(1) [],
        DSUS OFFSET(17) NUMBITS(1) [],
        LPM_SUS OFFSET(19) NUMBITS(1) [],
        LPM_REWP OFFSET(20) NUMBITS(1) [],
        SPEED OFFSET(22) NUMBITS(2) [
            Unknown = 0,
            FullSpeed = 1,
            HighSpeed = 2,
            SuperSpeed = 3
        ],
        DCON_C OFFSET(24) NUMBITS(1) [],
        DSUS_C OFFSET(25) NUMBITS(1) [],
        DRES_C OFFSET(26) NUMBITS(1) [],
        VBUS_DEBOUNCED OFFSET(28) NUMBITS(1) [],
        PHY_TEST_MODE OFFSET(29) NUMBITS(3) []
    ],

    pub INFO [
        FRAME_NR OFFSET(0) NUMBITS(11) [],
        ERR_CODE OFFSET(11) NUMBITS(4) [],
        MINREV OFFSET(16) NUMBITS(8) [],
        MAJREV OFFSET(24) NUMBITS(8) []
    ],

    pub INT [
        /// One bit per physical endpoint, EP0 OUT is bit 0
        EP OFFSET(0) NUMBITS(12) [],
        FRAME_INT OFFSET(30) NUMBITS(1) [],
        DEV_INT OFFSET(31) NUMBITS(1) []
    ],

    /// Endpoint command/status entry, one per buffer
    pub EPCS [
        /// Buffer offset from DATABUFSTART in 64 byte units
        ADDROFF OFFSET(0) NUMBITS(11) [],
        /// IN: bytes to send. OUT: bytes still free, decremented by hardware
        NBYTES OFFSET(11) NUMBITS(15) [],
        T OFFSET(26) NUMBITS(1) [
            Generic = 0,
            Isochronous = 1
        ],
        RF_TV OFFSET(27) NUMBITS(1) [],
        TR OFFSET(28) NUMBITS(1) [],
        S OFFSET(29) NUMBITS(1) [],
        D OFFSET(30) NUMBITS(1) [],
        A OFFSET(31) NUMBITS(1) []
    ]
];

/// Change flags in DEVCMDSTAT that are cleared by writing 1.
pub const DEVCMDSTAT_W1C: u32 = (1 << 8) | (1 << 24) | (1 << 25) | (1 << 26);

pub type EpEntry = ReadWrite<u32, EPCS::Register>;

/// Physical endpoint index: OUT and IN of one logical number are separate slots.
pub const fn physical_index(number: u8, direction: Direction) -> usize {
    number as usize * 2
        + match direction {
            Direction::Out => 0,
            Direction::In => 1,
        }
}

/// Access to the controller registers and its endpoint SRAM.
///
/// The endpoint command/status list lives at the very start of the SRAM,
/// packet buffers follow it.
pub struct Usbhs {
    regs: NonNull<UsbhsRegisters>,
    sram: NonNull<u8>,
    sram_size: usize,
    num_endpoints: usize,
}

unsafe impl Send for Usbhs {}
unsafe impl Sync for Usbhs {}

impl Usbhs {
    /// # Safety
    ///
    /// `regs` must point to the USB1 register block and `sram` to at least
    /// `sram_size` bytes of endpoint memory, both valid for the lifetime of
    /// the returned value.
    pub unsafe fn new(regs: Mmio, sram: Mmio, sram_size: usize, num_endpoints: usize) -> Self {
        Self {
            regs: regs.cast(),
            sram,
            sram_size,
            num_endpoints,
        }
    }

    pub fn regs(&self) -> &UsbhsRegisters {
        unsafe { self.regs.as_ref() }
    }

    pub fn num_endpoints(&self) -> usize {
        self.num_endpoints
    }

    pub fn sram_size(&self) -> usize {
        self.sram_size
    }

    pub fn ep_list_size(&self) -> usize {
        ep_list_size(self.num_endpoints)
    }

    pub fn entry(&self, physical: usize, buffer: usize) -> &EpEntry {
        debug_assert!(physical < self.num_endpoints * 2);
        debug_assert!(buffer < BUFFERS_PER_PHYSICAL_EP);
        let offset = (physical * BUFFERS_PER_PHYSICAL_EP + buffer) * EP_LIST_ENTRY_SIZE;
        unsafe { &*(self.sram.as_ptr().add(offset) as *const EpEntry) }
    }

    /// `AddrOff` value for a buffer at `offset` bytes into the SRAM.
    pub fn addroff(offset: usize) -> u32 {
        debug_assert!(offset % BUFFER_ALIGN == 0);
        (offset / BUFFER_ALIGN) as u32
    }

    pub fn write_buffer(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.sram_size);
        let base = unsafe { self.sram.as_ptr().add(offset) };
        for (i, byte) in data.iter().enumerate() {
            unsafe { base.add(i).write_volatile(*byte) };
        }
    }

    pub fn read_buffer(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.sram_size);
        let base = unsafe { self.sram.as_ptr().add(offset) };
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { base.add(i).read_volatile() };
        }
    }

    /// Points EPLISTSTART and DATABUFSTART at the endpoint SRAM.
    pub fn program_list_base(&self) {
        let base = self.sram.as_ptr() as usize as u32;
        self.regs().epliststart.set(base);
        self.regs().databufstart.set(base);
    }

    /// Read-modify-write of DEVCMDSTAT that never acknowledges a pending
    /// change flag by accident.
    pub fn update_devcmdstat(&self, field: FieldValue<u32, DEVCMDSTAT::Register>) {
        let current = self.regs().devcmdstat.get() & !DEVCMDSTAT_W1C;
        self.regs()
            .devcmdstat
            .modify_no_read(LocalRegisterCopy::new(current), field);
    }

    /// Acknowledges the DEVCMDSTAT change flags set in `flags`.
    pub fn clear_devcmdstat(&self, flags: u32) {
        let current = self.regs().devcmdstat.get() & !DEVCMDSTAT_W1C;
        self.regs()
            .devcmdstat
            .set(current | (flags & DEVCMDSTAT_W1C));
    }

    pub fn set_bit<R: RegisterLongName>(reg: &ReadWrite<u32, R>, bit: usize, value: bool) {
        let current = reg.get();
        if value {
            reg.set(current | (1 << bit));
        } else {
            reg.set(current & !(1 << bit));
        }
    }
}
