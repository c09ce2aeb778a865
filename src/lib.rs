#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::ptr::NonNull;

pub use usb_if::descriptor::*;
pub use usb_if::err::*;
pub use usb_if::transfer::*;
pub use usb_if::{DeviceSpeed, DeviceState};

pub mod consts;
mod control;
mod device;
mod endpoint;
pub mod err;
pub mod osal;
mod ram;
mod reg;
mod sync;
mod transfer;

#[cfg(test)]
mod mock;

pub use control::{ControlContext, ControlState, SetupHandler};
pub use device::{UsbEvents, Usbd, UsbdConfig};
pub use osal::{ClockOp, IrqOp, Kernel, PhyOp, Platform};
pub use transfer::{EndpointHandler, EndpointIo};

pub type Mmio = NonNull<u8>;
