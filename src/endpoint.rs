//! Physical endpoint slot table.

use alloc::{boxed::Box, vec::Vec};

use log::{debug, error};
use usb_if::descriptor::{BufferMode, EndpointAddress, EndpointDescriptor, EndpointType};

use crate::{
    err::*,
    ram::{EndpointRam, Region},
    reg::physical_index,
    transfer::{EndpointHandler, EndpointState},
};

pub(crate) struct BoundEndpoint {
    pub state: EndpointState,
    pub handler: Box<dyn EndpointHandler>,
}

enum Slot {
    Free,
    /// Physical 0 and 1, owned by the control pipe.
    Control,
    Bound(Box<BoundEndpoint>),
}

impl Slot {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

pub(crate) struct Registry {
    num_endpoints: usize,
    slots: Vec<Slot>,
}

impl Registry {
    pub fn new(num_endpoints: usize) -> Self {
        let mut slots = Vec::with_capacity(num_endpoints * 2);
        slots.resize_with(num_endpoints * 2, || Slot::Free);
        Self {
            num_endpoints,
            slots,
        }
    }

    pub fn reserve_control(&mut self) {
        self.slots[0] = Slot::Control;
        self.slots[1] = Slot::Control;
    }

    /// Binds a descriptor to its physical slot and gives it packet buffers.
    ///
    /// Nothing is left behind on failure: buffers already taken are handed
    /// back before the error is returned.
    pub fn register(
        &mut self,
        ram: &mut EndpointRam,
        desc: EndpointDescriptor,
        handler: Box<dyn EndpointHandler>,
    ) -> Result<&mut BoundEndpoint> {
        if desc.number as usize >= self.num_endpoints {
            return Err(UsbdError::EndpointNumber);
        }
        let physical = physical_index(desc.number, desc.direction);
        if !self.slots[physical].is_free() {
            return Err(UsbdError::EndpointAlreadyRegistered);
        }
        // only physical 0/1 can run the SETUP protocol
        if desc.transfer_type == EndpointType::Control {
            return Err(UsbdError::EndpointPhysicalIndex);
        }
        if desc.transfer_type == EndpointType::Isochronous && desc.buffer_mode == BufferMode::Single {
            return Err(UsbdError::EndpointBufferMode);
        }

        let mut buffers = Vec::with_capacity(desc.buffer_mode.buffers());
        for _ in 0..desc.buffer_mode.buffers() {
            match ram.allocate(desc.max_packet_size as usize) {
                Ok(region) => buffers.push(region),
                Err(e) => {
                    release(ram, &buffers)?;
                    return Err(e);
                }
            }
        }

        debug!(
            "{}: registered, {:?}, {} bytes of buffer",
            desc.address(),
            desc.transfer_type,
            buffers.iter().map(|r| r.size).sum::<usize>()
        );
        self.slots[physical] = Slot::Bound(Box::new(BoundEndpoint {
            state: EndpointState::new(desc, buffers),
            handler,
        }));
        match &mut self.slots[physical] {
            Slot::Bound(ep) => Ok(ep.as_mut()),
            _ => unreachable!(),
        }
    }

    /// Releases the slot and its buffers. The caller disables the hardware
    /// entries first.
    pub fn unregister(&mut self, ram: &mut EndpointRam, address: EndpointAddress) -> Result {
        let physical = self.physical_of(address)?;
        let Slot::Bound(ep) = core::mem::replace(&mut self.slots[physical], Slot::Free) else {
            unreachable!()
        };
        release(ram, ep.state.buffers())?;
        debug!("{address}: unregistered");
        Ok(())
    }

    fn physical_of(&self, address: EndpointAddress) -> Result<usize> {
        if address.number as usize >= self.num_endpoints {
            return Err(UsbdError::EndpointNotRegistered);
        }
        let physical = physical_index(address.number, address.direction);
        match self.slots[physical] {
            Slot::Bound(_) => Ok(physical),
            _ => Err(UsbdError::EndpointNotRegistered),
        }
    }

    pub fn get_mut(&mut self, address: EndpointAddress) -> Result<&mut BoundEndpoint> {
        let physical = self.physical_of(address)?;
        self.get_physical_mut(physical)
            .ok_or(UsbdError::EndpointNotRegistered)
    }

    pub fn get_physical_mut(&mut self, physical: usize) -> Option<&mut BoundEndpoint> {
        match self.slots.get_mut(physical) {
            Some(Slot::Bound(ep)) => Some(ep.as_mut()),
            _ => None,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BoundEndpoint> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Bound(ep) => Some(ep.as_mut()),
            _ => None,
        })
    }

    /// Drops every application endpoint, leaving the control slots reserved.
    pub fn drain(&mut self) -> Vec<Box<BoundEndpoint>> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::Bound(_))
                && let Slot::Bound(ep) = core::mem::replace(slot, Slot::Free)
            {
                out.push(ep);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::Free;
        }
    }
}

/// Hands buffers back to the allocator. A failure here means the accounting
/// of the two sides disagrees.
pub(crate) fn release(ram: &mut EndpointRam, buffers: &[Region]) -> Result {
    for region in buffers {
        if let Err(e) = ram.free(*region) {
            error!("ram: lost track of {:#x}+{}: {e}", region.offset, region.size);
            debug_assert!(false, "endpoint buffer accounting out of sync");
            return Err(e);
        }
    }
    Ok(())
}
