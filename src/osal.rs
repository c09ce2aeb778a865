use alloc::boxed::Box;
use core::time::Duration;

pub use usb_if::err::LowLevelError;

/// High-speed transceiver bring-up.
pub trait PhyOp: Send + 'static {
    fn init(&mut self) -> Result<(), LowLevelError>;
    fn de_init(&mut self) -> Result<(), LowLevelError>;
}

/// Clock domain and reset of the controller.
pub trait ClockOp: Send + 'static {
    fn init(&mut self) -> Result<(), LowLevelError>;
    fn de_init(&mut self) -> Result<(), LowLevelError>;
}

pub trait Kernel: Send + 'static {
    /// Blocking delay, only used while bringing the controller up.
    fn delay(&mut self, duration: Duration) -> Result<(), LowLevelError>;
}

/// The single interrupt line of the controller.
pub trait IrqOp: Send + Sync + 'static {
    fn set_priority(&self, priority: u8);
    fn enable(&self);
    fn disable(&self);
    fn is_enabled(&self) -> bool;
}

/// Collaborators the driver sequences but does not implement.
pub struct Platform {
    pub phy: Box<dyn PhyOp>,
    pub clock: Box<dyn ClockOp>,
    pub kernel: Box<dyn Kernel>,
    pub irq: Box<dyn IrqOp>,
}

impl Platform {
    pub fn new(
        phy: impl PhyOp,
        clock: impl ClockOp,
        kernel: impl Kernel,
        irq: impl IrqOp,
    ) -> Self {
        Self {
            phy: Box::new(phy),
            clock: Box::new(clock),
            kernel: Box::new(kernel),
            irq: Box::new(irq),
        }
    }
}
