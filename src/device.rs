use alloc::boxed::Box;
use core::{ptr::NonNull, time::Duration};

use bitflags::bitflags;
use log::{debug, error, info, warn};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use usb_if::{
    DeviceSpeed, DeviceState,
    descriptor::{EndpointAddress, EndpointDescriptor},
};

use crate::{
    Mmio,
    consts::*,
    control::{ControlPipe, ControlState, SetupHandler},
    endpoint::{Registry, release},
    err::*,
    osal::{ClockOp, IrqOp, Kernel, Platform, PhyOp},
    ram::EndpointRam,
    reg::{DEVCMDSTAT, EPCS, INT, Usbhs},
    sync::{IrqLock, IrqLockGuard},
    transfer::{EndpointHandler, EndpointIo},
};


/// Controller instance description.
#[derive(Debug, Clone)]
pub struct UsbdConfig {
    pub regs: Mmio,
    pub sram: Mmio,
    pub sram_size: usize,
    /// Logical endpoints, control included.
    pub num_endpoints: usize,
    pub ep0_max_packet_size: u16,
    pub speed: DeviceSpeed,
    pub phy_settle: Duration,
}

impl UsbdConfig {
    pub fn new(regs: Mmio, sram: Mmio) -> Self {
        Self {
            regs,
            sram,
            sram_size: USB1_SRAM_SIZE,
            num_endpoints: NUM_ENDPOINTS,
            ep0_max_packet_size: EP0_MAX_PACKET_SIZE,
            speed: DeviceSpeed::High,
            phy_settle: Duration::from_millis(PHY_SETTLE_MS),
        }
    }
}

impl Default for UsbdConfig {
    /// USB1 of the LPC55 family at its reset memory map.
    fn default() -> Self {
        unsafe {
            Self::new(
                NonNull::new_unchecked(USB1_BASE as *mut u8),
                NonNull::new_unchecked(USB1_SRAM_ADDR as *mut u8),
            )
        }
    }
}

bitflags! {
    /// What [`Usbd::handle_irq`] found and dealt with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbEvents: u32 {
        /// The host reset the bus. Call [`Usbd::reset`].
        const BUS_RESET = 1 << 0;
        const SUSPEND = 1 << 1;
        const RESUME = 1 << 2;
        const CONNECT_CHANGE = 1 << 3;
        const SETUP = 1 << 4;
        /// Progress of a control transfer data or status stage.
        const CONTROL = 1 << 5;
        /// At least one application endpoint completed a transfer.
        const ENDPOINT = 1 << 6;
    }
}

const DEVICE_CHANGES: u32 = DEVCMDSTAT::DRES_C::SET.value
    | DEVCMDSTAT::DSUS_C::SET.value
    | DEVCMDSTAT::DCON_C::SET.value;

struct Inner {
    config: UsbdConfig,
    state: DeviceState,
    phy: Box<dyn PhyOp>,
    clock: Box<dyn ClockOp>,
    kernel: Box<dyn Kernel>,
    ram: EndpointRam,
    registry: Registry,
    control: Option<ControlPipe>,
    setup_handler: Option<Box<dyn SetupHandler>>,
}

impl Inner {
    /// Best effort, used to unwind a failed bring-up.
    fn power_down(&mut self) {
        if let Err(e) = self.phy.de_init() {
            warn!("phy de-init failed: {e}");
        }
        self.power_down_clock();
    }

    fn power_down_clock(&mut self) {
        if let Err(e) = self.clock.de_init() {
            warn!("clock de-init failed: {e}");
        }
    }

    fn check_initialized(&self) -> Result {
        if self.state.is_initialized() {
            Ok(())
        } else {
            Err(UsbdError::Uninitialized)
        }
    }

    fn check_running(&self) -> Result {
        if self.state.is_running() {
            Ok(())
        } else {
            Err(UsbdError::Uninitialized)
        }
    }
}

fn setup_handler(slot: &mut Option<Box<dyn SetupHandler>>) -> Option<&mut dyn SetupHandler> {
    match slot {
        Some(handler) => Some(handler.as_mut()),
        None => None,
    }
}

/// Device-side driver for one USB1 high-speed controller.
///
/// Application calls lock the driver state with the controller interrupt
/// masked; [`Usbd::handle_irq`] is the only entry meant for interrupt context.
/// Endpoint and setup handlers run inside `handle_irq` and must not call
/// back into the `Usbd`.
pub struct Usbd {
    hw: Usbhs,
    irq: Box<dyn IrqOp>,
    inner: IrqLock<Inner>,
}

unsafe impl Send for Usbd {}
unsafe impl Sync for Usbd {}

impl Usbd {
    /// # Safety
    ///
    /// `config.regs` and `config.sram` must describe the controller register
    /// block and its endpoint SRAM, owned by this driver for its lifetime.
    pub unsafe fn new(config: UsbdConfig, platform: Platform) -> Self {
        let hw = unsafe {
            Usbhs::new(
                config.regs,
                config.sram,
                config.sram_size,
                config.num_endpoints,
            )
        };
        let Platform {
            phy,
            clock,
            kernel,
            irq,
        } = platform;
        let registry = Registry::new(config.num_endpoints);
        Self {
            hw,
            irq,
            inner: IrqLock::new(Inner {
                config,
                state: DeviceState::Uninitialized,
                phy,
                clock,
                kernel,
                ram: EndpointRam::new(0, 0),
                registry,
                control: None,
                setup_handler: None,
            }),
        }
    }

    fn lock(&self) -> IrqLockGuard<'_, Inner> {
        self.inner.lock(self.irq.as_ref())
    }

    /// Brings the controller up: clock, PHY, endpoint list and the control
    /// endpoint. The controller stays off the bus until [`Usbd::start`].
    pub fn init(&self, priority: u8) -> Result {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state.is_initialized() {
                return Err(UsbdError::AlreadyInitialized);
            }
            let config = &inner.config;
            if config.speed == DeviceSpeed::Low {
                return Err(UsbdError::Speed);
            }
            if config.num_endpoints == 0 || config.num_endpoints > NUM_ENDPOINTS {
                return Err(UsbdError::EndpointNumber);
            }
            if config.ep0_max_packet_size == 0
                || config.ep0_max_packet_size > config.speed.control_max_packet_size()
            {
                return Err(UsbdError::PacketSizeOverflow);
            }

            inner.clock.init().map_err(UsbdError::Syscon)?;
            if let Err(e) = inner.phy.init() {
                inner.power_down_clock();
                return Err(UsbdError::Phy(e));
            }
            let settle = inner
                .kernel
                .delay(inner.config.phy_settle)
                .map_err(UsbdError::Systick);
            if let Err(e) = settle.and_then(|()| self.setup_controller(inner)) {
                inner.power_down();
                return Err(e);
            }
            inner.state = DeviceState::Initialized;
        }

        self.irq.set_priority(priority);
        self.irq.enable();
        info!(
            "usbd: initialized, {} endpoints, {} bytes of buffer RAM",
            self.hw.num_endpoints(),
            self.free_ram()
        );
        Ok(())
    }

    fn setup_controller(&self, inner: &mut Inner) -> Result {
        let regs = self.hw.regs();
        regs.inten.set(0);
        regs.intstat.set(regs.intstat.get());
        regs.devcmdstat.set(0);
        regs.epskip.set(0);
        regs.epbufcfg.set(0);
        regs.epinuse.set(0);
        for physical in 0..self.hw.num_endpoints() * 2 {
            for buffer in 0..BUFFERS_PER_PHYSICAL_EP {
                self.hw.entry(physical, buffer).write(EPCS::D::SET);
            }
        }
        self.hw.program_list_base();

        let list = self.hw.ep_list_size();
        let end = self.hw.sram_size().min(BUFFER_ADDRESS_RANGE);
        inner.ram = EndpointRam::new(list, end.saturating_sub(list));
        inner.registry = Registry::new(self.hw.num_endpoints());
        inner.registry.reserve_control();

        let mps = inner.config.ep0_max_packet_size as usize;
        let out = inner.ram.allocate(mps)?;
        let setup = inner.ram.allocate(SETUP_PACKET_SIZE)?;
        let in_ = inner.ram.allocate(mps)?;
        let mut control = ControlPipe::new(mps, out, setup, in_);
        control.configure(&self.hw);
        inner.control = Some(control);
        debug!("usbd: ep list {list} bytes, buffer pool {} bytes", inner.ram.capacity());
        Ok(())
    }

    /// Inverse of [`Usbd::init`]. Every registration and the setup handler
    /// are dropped.
    pub fn de_init(&self) -> Result {
        let result = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.check_initialized()?;

            self.disconnect();
            for ep in inner.registry.iter_mut() {
                ep.state.disable(&self.hw);
            }
            inner.registry.clear();
            if let Some(control) = inner.control.as_mut() {
                control.reset(&self.hw);
            }
            inner.control = None;
            inner.setup_handler = None;
            inner.ram.reset();
            inner.state = DeviceState::Uninitialized;

            let phy = inner.phy.de_init().map_err(UsbdError::Phy);
            let clock = inner.clock.de_init().map_err(UsbdError::Syscon);
            phy.and(clock)
        };
        self.irq.disable();
        info!("usbd: de-initialized");
        result
    }

    fn disconnect(&self) {
        self.hw.update_devcmdstat(
            DEVCMDSTAT::DEV_EN::CLEAR + DEVCMDSTAT::DCON::CLEAR + DEVCMDSTAT::DEV_ADDR.val(0),
        );
        self.hw.regs().inten.set(0);
    }

    /// Reaction to a bus reset: every application endpoint is dropped and
    /// its buffer RAM returned, the control endpoint goes back to idle and
    /// the device answers at address 0 again.
    ///
    /// The controller stays on the bus, so an `Addressed` device goes back to
    /// `Started` (the USB default state), not to `Initialized`. Other states
    /// are left as they are.
    pub fn reset(&self) -> Result {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;

        let mut result = Ok(());
        for mut ep in inner.registry.drain() {
            ep.state.disable(&self.hw);
            result = result.and(release(&mut inner.ram, ep.state.buffers()));
        }
        if let Some(control) = inner.control.as_mut() {
            control.reset(&self.hw);
        }
        self.hw.update_devcmdstat(DEVCMDSTAT::DEV_ADDR.val(0));
        if let DeviceState::Addressed(_) = inner.state {
            inner.state = DeviceState::Started;
        }
        info!("usbd: reset");
        result
    }

    /// Connects to the bus and starts answering the host.
    pub fn start(&self) -> Result {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;
        if inner.state.is_running() {
            return Ok(());
        }

        let regs = self.hw.regs();
        regs.inten.set(0b11);
        regs.inten.modify(INT::DEV_INT::SET);
        for ep in inner.registry.iter_mut() {
            ep.state.start(&self.hw);
        }
        self.hw
            .update_devcmdstat(DEVCMDSTAT::DEV_EN::SET + DEVCMDSTAT::DCON::SET);
        inner.state = DeviceState::Started;
        info!("usbd: started");
        Ok(())
    }

    /// Leaves the bus. Registrations are kept, queued transfers are dropped.
    pub fn stop(&self) -> Result {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;

        self.disconnect();
        for ep in inner.registry.iter_mut() {
            ep.state.abort(&self.hw);
        }
        if let Some(control) = inner.control.as_mut() {
            control.reset(&self.hw);
        }
        inner.state = DeviceState::Initialized;
        info!("usbd: stopped");
        Ok(())
    }

    pub fn register_setup_callback(&self, handler: impl SetupHandler) -> Result {
        let mut guard = self.lock();
        guard.check_initialized()?;
        guard.setup_handler = Some(Box::new(handler));
        Ok(())
    }

    /// Binds an application endpoint. If the device is already on the bus
    /// the endpoint is live immediately.
    pub fn register_endpoint(
        &self,
        desc: EndpointDescriptor,
        handler: impl EndpointHandler,
    ) -> Result {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;

        let running = inner.state.is_running();
        let ep = inner
            .registry
            .register(&mut inner.ram, desc, Box::new(handler))?;
        ep.state.configure(&self.hw);
        if running {
            ep.state.start(&self.hw);
        }
        Ok(())
    }

    /// The endpoint must be quiet; whatever is queued on it is dropped.
    pub fn unregister_endpoint(&self, address: impl Into<EndpointAddress>) -> Result {
        let address = address.into();
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;

        inner.registry.get_mut(address)?.state.disable(&self.hw);
        inner.registry.unregister(&mut inner.ram, address)
    }

    /// Takes effect when the status stage of the current control transfer
    /// completes, never earlier.
    pub fn set_address(&self, address: u8) -> Result {
        if address > MAX_DEVICE_ADDRESS {
            return Err(UsbdError::Address);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_initialized()?;
        if let Some(control) = inner.control.as_mut() {
            control.set_pending_address(address);
        }
        debug!("usbd: address {address} pending");
        Ok(())
    }

    /// Queues `data` on an IN endpoint. The endpoint handler runs once the
    /// host has taken all of it.
    pub fn write(&self, address: impl Into<EndpointAddress>, data: &[u8]) -> Result {
        let mut guard = self.lock();
        guard.check_running()?;
        guard.registry.get_mut(address.into())?.state.write(&self.hw, data)
    }

    /// Copies the oldest received packet on an OUT endpoint into `out`.
    /// Returns 0 when nothing is waiting.
    pub fn read(&self, address: impl Into<EndpointAddress>, out: &mut [u8]) -> Result<usize> {
        let mut guard = self.lock();
        guard.check_running()?;
        guard.registry.get_mut(address.into())?.state.read(&self.hw, out)
    }

    pub fn set_stalled(&self, address: impl Into<EndpointAddress>, stalled: bool) -> Result {
        let mut guard = self.lock();
        guard.check_initialized()?;
        guard
            .registry
            .get_mut(address.into())?
            .state
            .set_stalled(&self.hw, stalled);
        Ok(())
    }

    pub fn is_stalled(&self, address: impl Into<EndpointAddress>) -> Result<bool> {
        let mut guard = self.lock();
        guard.check_initialized()?;
        Ok(guard
            .registry
            .get_mut(address.into())?
            .state
            .is_stalled(&self.hw))
    }

    /// Speed negotiated with the host.
    pub fn speed(&self) -> Result<DeviceSpeed> {
        match self.hw.regs().devcmdstat.read_as_enum(DEVCMDSTAT::SPEED) {
            Some(DEVCMDSTAT::SPEED::Value::FullSpeed) => Ok(DeviceSpeed::Full),
            Some(DEVCMDSTAT::SPEED::Value::HighSpeed) => Ok(DeviceSpeed::High),
            _ => Err(UsbdError::Speed),
        }
    }

    /// Address the controller currently answers at.
    pub fn address(&self) -> u8 {
        self.hw.regs().devcmdstat.read(DEVCMDSTAT::DEV_ADDR) as u8
    }

    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    pub fn control_state(&self) -> Option<ControlState> {
        self.lock().control.as_ref().map(|c| c.state())
    }

    /// Endpoint buffer RAM not yet handed to an endpoint.
    pub fn free_ram(&self) -> usize {
        self.lock().ram.free_bytes()
    }

    /// Interrupt entry. Acknowledges and processes everything pending:
    /// control transfer stages, endpoint completions (running their
    /// handlers) and bus state changes.
    pub fn handle_irq(&self) -> UsbEvents {
        let mut events = UsbEvents::empty();
        let mut guard = self.inner.lock_in_irq();
        let inner = &mut *guard;

        let regs = self.hw.regs();
        let status = regs.intstat.extract();
        regs.intstat.set(status.get());
        if !inner.state.is_initialized() {
            return events;
        }

        if status.is_set(INT::DEV_INT) {
            let dev = regs.devcmdstat.extract();
            self.hw.clear_devcmdstat(dev.get() & DEVICE_CHANGES);
            if dev.is_set(DEVCMDSTAT::DRES_C) {
                info!("usbd: bus reset");
                events |= UsbEvents::BUS_RESET;
            }
            if dev.is_set(DEVCMDSTAT::DSUS_C) {
                if dev.is_set(DEVCMDSTAT::DSUS) {
                    debug!("usbd: suspend");
                    events |= UsbEvents::SUSPEND;
                } else {
                    debug!("usbd: resume");
                    events |= UsbEvents::RESUME;
                }
            }
            if dev.is_set(DEVCMDSTAT::DCON_C) {
                debug!("usbd: connect change");
                events |= UsbEvents::CONNECT_CHANGE;
            }
        }

        let endpoints = status.read(INT::EP);
        if let Some(control) = inner.control.as_mut() {
            // finish a status stage before a new SETUP can drop it
            if endpoints & 0b10 != 0 {
                let handler = setup_handler(&mut inner.setup_handler);
                if let Some(address) = control.on_in_complete(&self.hw, handler) {
                    inner.state = match address {
                        0 => DeviceState::Started,
                        address => DeviceState::Addressed(address),
                    };
                }
                events |= UsbEvents::CONTROL;
            }
            if endpoints & 0b01 != 0 {
                let handler = setup_handler(&mut inner.setup_handler);
                if regs.devcmdstat.is_set(DEVCMDSTAT::SETUP) {
                    if let Err(e) = control.on_setup(&self.hw, handler) {
                        error!("ep0: bad setup packet: {e}");
                    }
                    events |= UsbEvents::SETUP;
                } else {
                    control.on_out_complete(&self.hw, handler);
                    events |= UsbEvents::CONTROL;
                }
            }
        }

        for physical in 2..self.hw.num_endpoints() * 2 {
            if endpoints & (1 << physical) == 0 {
                continue;
            }
            let Some(ep) = inner.registry.get_physical_mut(physical) else {
                warn!("usbd: completion on unbound endpoint {physical}");
                continue;
            };
            let count = ep.state.complete(&self.hw);
            for _ in 0..count {
                let mut io = EndpointIo::new(&mut ep.state, &self.hw);
                ep.handler.transfer_complete(&mut io);
            }
            events |= UsbEvents::ENDPOINT;
        }
        events
    }
}
