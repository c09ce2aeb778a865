//! Endpoint 0 control transfer sequencing.
//!
//! EP0 uses three buffers: OUT data (physical 0, buffer 0), SETUP
//! (physical 0, buffer 1) and IN data (physical 1, buffer 0). A SETUP token
//! always restarts the state machine, whatever stage it was in.

use alloc::vec::Vec;

use log::{debug, info, trace, warn};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use usb_if::transfer::{Direction, RequestOperation, SetupPacket};

use crate::{
    consts::MAX_DEVICE_ADDRESS,
    err::*,
    ram::Region,
    reg::{DEVCMDSTAT, EPCS, Usbhs},
};

const EP0_OUT: usize = 0;
const EP0_IN: usize = 1;
const SETUP_BUFFER: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    SetupReceived,
    DataIn,
    DataOut,
    /// Zero length handshake pending, in the given direction.
    Status(Direction),
    Stalled,
}

/// Classifies requests arriving on endpoint 0. Runs in interrupt context.
pub trait SetupHandler: Send + 'static {
    fn setup(&mut self, setup: &SetupPacket, ctx: &mut ControlContext<'_>) -> RequestOperation;

    /// The DATA_OUT stage of a `Write` request has been received in full.
    fn data_out(&mut self, _setup: &SetupPacket, _data: &[u8]) {}

    /// The status stage completed, the request is done.
    fn status_complete(&mut self, _setup: &SetupPacket) {}
}

impl<F> SetupHandler for F
where
    F: FnMut(&SetupPacket, &mut ControlContext<'_>) -> RequestOperation + Send + 'static,
{
    fn setup(&mut self, setup: &SetupPacket, ctx: &mut ControlContext<'_>) -> RequestOperation {
        self(setup, ctx)
    }
}

pub struct ControlContext<'a> {
    response: &'a mut Vec<u8>,
    address: &'a mut Option<u8>,
}

impl ControlContext<'_> {
    /// Payload for the DATA_IN stage of a `Read` request. Anything beyond
    /// `wLength` is dropped.
    pub fn respond(&mut self, data: &[u8]) {
        self.response.clear();
        self.response.extend_from_slice(data);
    }

    /// Schedules a device address. It is applied once this request's
    /// status stage completes.
    pub fn set_address(&mut self, address: u8) -> Result {
        if address > MAX_DEVICE_ADDRESS {
            return Err(UsbdError::Address);
        }
        *self.address = Some(address);
        Ok(())
    }
}

pub(crate) struct ControlPipe {
    state: ControlState,
    setup: Option<SetupPacket>,
    mps: usize,
    out: Region,
    setup_buf: Region,
    in_: Region,
    data: Vec<u8>,
    offset: usize,
    last_len: usize,
    pending_address: Option<u8>,
}

impl ControlPipe {
    pub fn new(mps: usize, out: Region, setup_buf: Region, in_: Region) -> Self {
        Self {
            state: ControlState::Idle,
            setup: None,
            mps,
            out,
            setup_buf,
            in_,
            data: Vec::new(),
            offset: 0,
            last_len: 0,
            pending_address: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn set_pending_address(&mut self, address: u8) {
        self.pending_address = Some(address);
    }

    pub fn configure(&mut self, hw: &Usbhs) {
        hw.entry(EP0_OUT, 0)
            .write(EPCS::ADDROFF.val(Usbhs::addroff(self.out.offset)));
        hw.entry(EP0_OUT, SETUP_BUFFER)
            .write(EPCS::ADDROFF.val(Usbhs::addroff(self.setup_buf.offset)));
        hw.entry(EP0_IN, 0)
            .write(EPCS::ADDROFF.val(Usbhs::addroff(self.in_.offset)));
        hw.entry(EP0_IN, 1).set(0);
        self.reset(hw);
    }

    /// Back to idle, nothing armed, no address pending.
    pub fn reset(&mut self, hw: &Usbhs) {
        self.abort(hw);
        self.state = ControlState::Idle;
        self.setup = None;
        self.pending_address = None;
    }

    fn abort(&mut self, hw: &Usbhs) {
        for physical in [EP0_OUT, EP0_IN] {
            hw.entry(physical, 0)
                .modify(EPCS::A::CLEAR + EPCS::S::CLEAR);
        }
        self.data.clear();
        self.offset = 0;
        self.last_len = 0;
    }

    fn stall(&mut self, hw: &Usbhs) {
        for physical in [EP0_OUT, EP0_IN] {
            hw.entry(physical, 0).modify(EPCS::S::SET);
        }
        if let Some(setup) = &self.setup {
            warn!("ep0: stall request {:#04x}", setup.request);
        }
        self.state = ControlState::Stalled;
    }

    fn arm_out(&self, hw: &Usbhs) {
        hw.entry(EP0_OUT, 0).modify(
            EPCS::ADDROFF.val(Usbhs::addroff(self.out.offset))
                + EPCS::NBYTES.val(self.mps as u32)
                + EPCS::A::SET,
        );
    }

    fn send(&mut self, hw: &Usbhs, len: usize) {
        hw.write_buffer(self.in_.offset, &self.data[self.offset..self.offset + len]);
        hw.entry(EP0_IN, 0).modify(
            EPCS::ADDROFF.val(Usbhs::addroff(self.in_.offset))
                + EPCS::NBYTES.val(len as u32)
                + EPCS::A::SET,
        );
        self.offset += len;
        self.last_len = len;
    }

    fn send_next(&mut self, hw: &Usbhs) {
        let len = (self.data.len() - self.offset).min(self.mps);
        self.send(hw, len);
    }

    fn send_zlp(&mut self, hw: &Usbhs) {
        self.send(hw, 0);
    }

    /// A SETUP token arrived. Whatever EP0 was doing is dropped.
    pub fn on_setup(&mut self, hw: &Usbhs, handler: Option<&mut dyn SetupHandler>) -> Result {
        let mut raw = [0u8; SetupPacket::LEN];
        hw.read_buffer(self.setup_buf.offset, &mut raw);
        hw.clear_devcmdstat(DEVCMDSTAT::SETUP::SET.value);

        if !matches!(self.state, ControlState::Idle | ControlState::Stalled) {
            warn!("ep0: setup during {:?}, previous request dropped", self.state);
            self.pending_address = None;
        }
        self.abort(hw);
        self.state = ControlState::SetupReceived;
        let setup = SetupPacket::parse(&raw)?;
        self.setup = Some(setup);

        let mut ctx = ControlContext {
            response: &mut self.data,
            address: &mut self.pending_address,
        };
        let op = match handler {
            Some(handler) => handler.setup(&setup, &mut ctx),
            None => RequestOperation::NotSupported,
        };
        debug!("ep0: request {:#04x} -> {op:?}", setup.request);

        let length = setup.length as usize;
        match op {
            RequestOperation::NotSupported => self.stall(hw),
            RequestOperation::Read => {
                if setup.direction != Direction::In {
                    self.stall(hw);
                } else if length == 0 {
                    // no data stage, the host takes our ZLP as the status
                    self.data.clear();
                    self.state = ControlState::Status(Direction::In);
                    self.send_zlp(hw);
                } else {
                    self.data.truncate(length);
                    self.state = ControlState::DataIn;
                    self.send_next(hw);
                }
            }
            RequestOperation::Write if length > 0 => {
                if setup.direction != Direction::Out {
                    self.stall(hw);
                } else {
                    self.data.clear();
                    self.state = ControlState::DataOut;
                    self.arm_out(hw);
                }
            }
            RequestOperation::Write | RequestOperation::WriteNoData => {
                if length > 0 {
                    self.stall(hw);
                } else {
                    self.data.clear();
                    self.state = ControlState::Status(Direction::In);
                    self.send_zlp(hw);
                }
            }
        }
        Ok(())
    }

    /// EP0 IN buffer finished. Returns the address latched by a completed
    /// status stage, if any.
    pub fn on_in_complete(
        &mut self,
        hw: &Usbhs,
        handler: Option<&mut dyn SetupHandler>,
    ) -> Option<u8> {
        if hw.entry(EP0_IN, 0).is_set(EPCS::A) {
            return None;
        }
        match self.state {
            ControlState::DataIn => {
                let wanted = self.setup.map_or(0, |s| s.length as usize);
                if self.offset < self.data.len() {
                    self.send_next(hw);
                } else if self.last_len == self.mps && self.data.len() < wanted {
                    // a short response ending on a packet boundary
                    self.send_zlp(hw);
                } else {
                    self.state = ControlState::Status(Direction::Out);
                    self.arm_out(hw);
                }
                None
            }
            ControlState::Status(Direction::In) => {
                self.state = ControlState::Idle;
                let latched = self.pending_address.take();
                if let Some(address) = latched {
                    hw.update_devcmdstat(DEVCMDSTAT::DEV_ADDR.val(address as u32));
                    info!("address {address} latched");
                }
                if let (Some(handler), Some(setup)) = (handler, &self.setup) {
                    handler.status_complete(setup);
                }
                latched
            }
            state => {
                trace!("ep0 in: completion ignored in {state:?}");
                None
            }
        }
    }

    /// EP0 OUT buffer received a data or status packet.
    pub fn on_out_complete(&mut self, hw: &Usbhs, handler: Option<&mut dyn SetupHandler>) {
        let entry = hw.entry(EP0_OUT, 0);
        if entry.is_set(EPCS::A) {
            return;
        }
        let Some(setup) = self.setup else {
            return;
        };
        match self.state {
            ControlState::DataOut => {
                let received = self.mps.saturating_sub(entry.read(EPCS::NBYTES) as usize);
                let wanted = setup.length as usize;
                let take = received.min(wanted - self.data.len());
                let start = self.data.len();
                self.data.resize(start + take, 0);
                hw.read_buffer(self.out.offset, &mut self.data[start..]);
                trace!("ep0 out: {received} bytes, {}/{wanted}", self.data.len());

                if self.data.len() >= wanted || received < self.mps {
                    if let Some(handler) = handler {
                        handler.data_out(&setup, &self.data);
                    }
                    self.state = ControlState::Status(Direction::In);
                    self.send_zlp(hw);
                } else {
                    self.arm_out(hw);
                }
            }
            ControlState::Status(Direction::Out) => {
                self.state = ControlState::Idle;
                if let Some(handler) = handler {
                    handler.status_complete(&setup);
                }
            }
            state => trace!("ep0 out: completion ignored in {state:?}"),
        }
    }
}
