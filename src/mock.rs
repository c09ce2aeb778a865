//! Simulated controller for host tests.
//!
//! Registers and endpoint SRAM are plain heap memory. Host traffic is played
//! by editing command list entries and raising `INTSTAT` bits the way the
//! controller does; there is no write-1-to-clear behaviour, [`MockBoard::service`]
//! clears status after the driver has seen it.

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    time::Duration,
};

use spin::Mutex;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::{
    Mmio,
    consts::NUM_ENDPOINTS,
    device::{UsbEvents, Usbd, UsbdConfig},
    err::LowLevelError,
    osal::{ClockOp, IrqOp, Kernel, PhyOp, Platform},
    reg::{DEVCMDSTAT, DEVCMDSTAT_W1C, EPCS, INT, Usbhs},
};

const REG_WORDS: usize = 16;
const SRAM_LEN: usize = 1024;
/// Gives 512 bytes of free buffer RAM once EP0 is set up.
pub const SRAM_SIZE: usize = 832;

#[repr(C, align(256))]
struct Sram([u8; SRAM_LEN]);

pub struct MockBoard {
    regs: Box<UnsafeCell<[u32; REG_WORDS]>>,
    sram: Box<UnsafeCell<Sram>>,
    hw: Usbhs,
}

impl MockBoard {
    pub fn new() -> Self {
        let regs = Box::new(UnsafeCell::new([0u32; REG_WORDS]));
        let sram = Box::new(UnsafeCell::new(Sram([0; SRAM_LEN])));
        let hw = unsafe {
            Usbhs::new(
                mmio(regs.get().cast()),
                mmio(sram.get().cast()),
                SRAM_SIZE,
                NUM_ENDPOINTS,
            )
        };
        Self { regs, sram, hw }
    }

    pub fn usbhs(&self) -> Usbhs {
        unsafe {
            Usbhs::new(
                mmio(self.regs.get().cast()),
                mmio(self.sram.get().cast()),
                SRAM_SIZE,
                NUM_ENDPOINTS,
            )
        }
    }

    pub fn config(&self) -> UsbdConfig {
        UsbdConfig {
            sram_size: SRAM_SIZE,
            ..UsbdConfig::new(mmio(self.regs.get().cast()), mmio(self.sram.get().cast()))
        }
    }

    pub fn is_active(&self, physical: usize, buffer: usize) -> bool {
        self.hw.entry(physical, buffer).is_set(EPCS::A)
    }

    pub fn is_disabled(&self, physical: usize, buffer: usize) -> bool {
        self.hw.entry(physical, buffer).is_set(EPCS::D)
    }

    pub fn intstat(&self) -> u32 {
        self.hw.regs().intstat.get()
    }

    pub fn inten(&self) -> u32 {
        self.hw.regs().inten.get()
    }

    pub fn devcmdstat(&self) -> u32 {
        self.hw.regs().devcmdstat.get()
    }

    fn raise(&self, physical: usize) {
        let intstat = &self.hw.regs().intstat;
        intstat.set(intstat.get() | (1 << physical));
    }

    fn buffer_offset(&self, physical: usize, buffer: usize) -> usize {
        self.hw.entry(physical, buffer).read(EPCS::ADDROFF) as usize * 64
    }

    /// The host reads an armed IN buffer.
    pub fn host_in(&self, physical: usize, buffer: usize) -> Vec<u8> {
        let entry = self.hw.entry(physical, buffer);
        assert!(entry.is_set(EPCS::A), "IN {physical}/{buffer} not armed");
        let mut data = vec![0u8; entry.read(EPCS::NBYTES) as usize];
        self.hw
            .read_buffer(self.buffer_offset(physical, buffer), &mut data);
        entry.modify(EPCS::A::CLEAR + EPCS::NBYTES.val(0));
        self.raise(physical);
        data
    }

    /// The host sends a data packet into an armed OUT buffer.
    pub fn host_out(&self, physical: usize, buffer: usize, data: &[u8]) {
        let entry = self.hw.entry(physical, buffer);
        assert!(entry.is_set(EPCS::A), "OUT {physical}/{buffer} not armed");
        let room = entry.read(EPCS::NBYTES) as usize;
        assert!(data.len() <= room, "packet larger than armed buffer");
        self.hw
            .write_buffer(self.buffer_offset(physical, buffer), data);
        entry.modify(EPCS::A::CLEAR + EPCS::NBYTES.val((room - data.len()) as u32));
        let devcmdstat = &self.hw.regs().devcmdstat;
        devcmdstat.set(devcmdstat.get() & !DEVCMDSTAT::SETUP::SET.value);
        self.raise(physical);
    }

    /// The host sends a SETUP packet; it always lands, armed or not.
    pub fn host_setup(&self, packet: [u8; 8]) {
        self.hw.write_buffer(self.buffer_offset(0, 1), &packet);
        self.hw.regs().devcmdstat.modify(DEVCMDSTAT::SETUP::SET);
        self.raise(0);
    }

    /// Device status change, e.g. `DRES_C` for a bus reset.
    pub fn device_event(&self, change: u32) {
        let devcmdstat = &self.hw.regs().devcmdstat;
        devcmdstat.set(devcmdstat.get() | change);
        self.hw.regs().intstat.modify(INT::DEV_INT::SET);
    }

    pub fn bus_reset(&self) {
        self.device_event(DEVCMDSTAT::DRES_C::SET.value);
    }

    pub fn set_speed(&self, speed: u32) {
        self.hw.regs().devcmdstat.modify(DEVCMDSTAT::SPEED.val(speed));
    }

    /// Runs the interrupt handler, then clears what the hardware would have
    /// cleared on the driver's acknowledge.
    pub fn service(&self, usbd: &Usbd) -> UsbEvents {
        let events = usbd.handle_irq();
        let regs = self.hw.regs();
        regs.intstat.set(0);
        regs.devcmdstat.set(regs.devcmdstat.get() & !DEVCMDSTAT_W1C);
        events
    }
}

fn mmio(ptr: *mut u8) -> Mmio {
    NonNull::new(ptr).unwrap()
}

/// Shared record of collaborator calls, in order.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn push(&self, call: &'static str) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Error codes the fake collaborators answer with instead of succeeding.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    pub clock: Option<u32>,
    pub phy: Option<u32>,
    pub delay: Option<u32>,
}

fn outcome(code: Option<u32>) -> Result<(), LowLevelError> {
    match code {
        Some(code) => Err(LowLevelError(code)),
        None => Ok(()),
    }
}

struct MockPhy {
    log: CallLog,
    fault: Option<u32>,
}

impl PhyOp for MockPhy {
    fn init(&mut self) -> Result<(), LowLevelError> {
        self.log.push("phy.init");
        outcome(self.fault)
    }

    fn de_init(&mut self) -> Result<(), LowLevelError> {
        self.log.push("phy.de_init");
        Ok(())
    }
}

struct MockClock {
    log: CallLog,
    fault: Option<u32>,
}

impl ClockOp for MockClock {
    fn init(&mut self) -> Result<(), LowLevelError> {
        self.log.push("clock.init");
        outcome(self.fault)
    }

    fn de_init(&mut self) -> Result<(), LowLevelError> {
        self.log.push("clock.de_init");
        Ok(())
    }
}

struct MockKernel {
    log: CallLog,
    fault: Option<u32>,
}

impl Kernel for MockKernel {
    fn delay(&mut self, duration: Duration) -> Result<(), LowLevelError> {
        assert!(!duration.is_zero());
        self.log.push("delay");
        outcome(self.fault)
    }
}

#[derive(Default)]
struct IrqState {
    enabled: AtomicBool,
    priority: AtomicU8,
    enables: AtomicUsize,
    disables: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockIrq(Arc<IrqState>);

impl MockIrq {
    pub fn priority(&self) -> u8 {
        self.0.priority.load(Ordering::SeqCst)
    }

    pub fn enable_count(&self) -> usize {
        self.0.enables.load(Ordering::SeqCst)
    }

    pub fn disable_count(&self) -> usize {
        self.0.disables.load(Ordering::SeqCst)
    }
}

impl IrqOp for MockIrq {
    fn set_priority(&self, priority: u8) {
        self.0.priority.store(priority, Ordering::SeqCst);
    }

    fn enable(&self) {
        self.0.enables.fetch_add(1, Ordering::SeqCst);
        self.0.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.0.disables.fetch_add(1, Ordering::SeqCst);
        self.0.enabled.store(false, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::SeqCst)
    }
}

pub fn platform(log: &CallLog, irq: &MockIrq, faults: Faults) -> Platform {
    Platform::new(
        MockPhy {
            log: log.clone(),
            fault: faults.phy,
        },
        MockClock {
            log: log.clone(),
            fault: faults.clock,
        },
        MockKernel {
            log: log.clone(),
            fault: faults.delay,
        },
        irq.clone(),
    )
}
